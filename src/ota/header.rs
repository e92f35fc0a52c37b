//! Header of the staged download.
//!
//! The modem stores the HTTP response headers in front of the body. The first block of
//! the file carries `Content-Length` and the server's `lsx-md5` digest of the body; the
//! body starts `file_size - content_length` bytes into the file.

use thiserror::Error;

/// Bytes read from the start of the staged file to find the header
pub const HEADER_BLOCK: usize = 2048;
const LENGTH_FIELD: &str = "Content-Length:";
const DIGEST_FIELD: &str = "lsx-md5:";
const DIGEST_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("No Content-Length in staged header")]
    MissingLength,

    #[error("Content-Length {length} does not fit a file of {file_size} bytes")]
    BadLength { length: u64, file_size: u32 },

    #[error("No digest in staged header")]
    MissingDigest,

    #[error("Malformed digest {0:?}")]
    BadDigest(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedHeader {
    pub content_length: u32,
    /// Lower-case hex MD5 of the body
    pub md5: String,
}

impl StagedHeader {
    pub fn parse(block: &[u8], file_size: u32) -> Result<Self, HeaderError> {
        let text = String::from_utf8_lossy(block);

        let length = field(&text, LENGTH_FIELD)
            .ok_or(HeaderError::MissingLength)?
            .parse::<u64>()
            .map_err(|_| HeaderError::MissingLength)?;
        if length == 0 || length >= u64::from(file_size) {
            return Err(HeaderError::BadLength { length, file_size });
        }

        let digest = field(&text, DIGEST_FIELD).ok_or(HeaderError::MissingDigest)?;
        let md5 = digest.get(..DIGEST_LEN).unwrap_or(digest);
        if md5.len() != DIGEST_LEN || !md5.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(HeaderError::BadDigest(digest.to_string()));
        }

        Ok(Self {
            content_length: length as u32,
            md5: md5.to_ascii_lowercase(),
        })
    }

    /// Offset of the first body byte in a staged file of `file_size` bytes
    pub fn body_offset(&self, file_size: u32) -> u32 {
        file_size - self.content_length
    }
}

fn field<'a>(text: &'a str, name: &str) -> Option<&'a str> {
    let start = text.find(name)? + name.len();
    let rest = &text[start..];
    let end = rest.find('\n')?;
    Some(rest[..end].trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "9E107D9D372BB6826BD81D3542A419D6";

    fn header(length: &str, digest: &str) -> Vec<u8> {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\n\
             Content-Length: {length}\r\nlsx-md5: {digest}\r\n\r\n"
        )
        .into_bytes()
    }

    #[test]
    fn parses_length_and_digest() {
        let block = header("1000", DIGEST);
        let parsed = StagedHeader::parse(&block, 1200).unwrap();
        assert_eq!(parsed.content_length, 1000);
        assert_eq!(parsed.md5, DIGEST.to_ascii_lowercase());
        assert_eq!(parsed.body_offset(1200), 200);
    }

    #[test]
    fn length_must_fit_inside_the_file() {
        assert_eq!(
            StagedHeader::parse(&header("1200", DIGEST), 1200),
            Err(HeaderError::BadLength { length: 1200, file_size: 1200 })
        );
        assert!(matches!(
            StagedHeader::parse(&header("0", DIGEST), 1200),
            Err(HeaderError::BadLength { .. })
        ));
    }

    #[test]
    fn digest_is_required() {
        let block = b"Content-Length: 10\r\n\r\n";
        assert_eq!(StagedHeader::parse(block, 100), Err(HeaderError::MissingDigest));
        assert!(matches!(
            StagedHeader::parse(&header("10", "abc123"), 100),
            Err(HeaderError::BadDigest(_))
        ));
        assert_eq!(
            StagedHeader::parse(b"lsx-md5: x\r\n", 100),
            Err(HeaderError::MissingLength)
        );
    }
}
