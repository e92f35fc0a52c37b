//! Scripted modem used by the unit tests.
//!
//! Echoes every command, answers by command prefix and serves one staged file through the
//! `AT+QF*` file commands so OTA reads can be exercised byte for byte.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::transport::Transport;

#[derive(Debug, Clone, Default)]
pub struct SentLog(Arc<Mutex<Vec<String>>>);

impl SentLog {
    pub fn commands(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.commands().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub fn contains(&self, prefix: &str) -> bool {
        self.count(prefix) > 0
    }

    fn push(&self, command: String) {
        self.0.lock().unwrap().push(command);
    }
}

struct Rule {
    prefix: String,
    replies: VecDeque<Vec<String>>,
    last: Vec<String>,
}

struct StagedFile {
    name: String,
    bytes: Vec<u8>,
    position: usize,
}

pub struct ScriptedModem {
    rules: Vec<Rule>,
    rx: VecDeque<u8>,
    log: SentLog,
    echo: bool,
    default_ok: bool,
    file: Option<StagedFile>,
    corrupt_at: Option<usize>,
}

impl Default for ScriptedModem {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedModem {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            rx: VecDeque::new(),
            log: SentLog::default(),
            echo: true,
            default_ok: false,
            file: None,
            corrupt_at: None,
        }
    }

    /// Always answers commands starting with `prefix` with `lines`
    pub fn on(self, prefix: &str, lines: &[&str]) -> Self {
        self.on_sequence(prefix, &[lines])
    }

    /// Answers successive commands with successive replies; the last one repeats
    pub fn on_sequence(mut self, prefix: &str, replies: &[&[&str]]) -> Self {
        let replies: VecDeque<Vec<String>> = replies
            .iter()
            .map(|lines| lines.iter().map(|l| l.to_string()).collect())
            .collect();
        let last = replies.back().cloned().unwrap_or_default();
        self.rules.push(Rule {
            prefix: prefix.to_string(),
            replies,
            last,
        });
        self
    }

    pub fn without_echo(mut self) -> Self {
        self.echo = false;
        self
    }

    /// Unmatched commands get a bare OK instead of silence
    pub fn default_ok(mut self) -> Self {
        self.default_ok = true;
        self
    }

    pub fn unsolicited(mut self, line: &str) -> Self {
        self.queue_line(line);
        self
    }

    pub fn with_file(mut self, name: &str, bytes: Vec<u8>) -> Self {
        self.file = Some(StagedFile {
            name: name.to_string(),
            bytes,
            position: 0,
        });
        self
    }

    /// Flips one bit of the byte at `offset` whenever it is read
    pub fn corrupt_byte(mut self, offset: usize) -> Self {
        self.corrupt_at = Some(offset);
        self
    }

    pub fn log(&self) -> SentLog {
        self.log.clone()
    }

    fn queue_line(&mut self, line: &str) {
        self.rx.extend(line.as_bytes());
        self.rx.extend(b"\r\n");
    }

    fn file_command(&mut self, command: &str) -> bool {
        let Some(file) = self.file.as_mut() else {
            return false;
        };
        let mut lines: Vec<String> = Vec::new();
        let mut raw: Option<Vec<u8>> = None;

        if command.starts_with("AT+QFLST") {
            lines.push(format!("+QFLST: \"{}\",{}", file.name, file.bytes.len()));
            lines.push("OK".into());
        } else if command.starts_with("AT+QFOPEN") {
            file.position = 0;
            lines.push("+QFOPEN: 1".into());
            lines.push("OK".into());
        } else if let Some(args) = command.strip_prefix("AT+QFSEEK=") {
            let offset = args.split(',').nth(1).and_then(|v| v.parse().ok()).unwrap_or(0);
            file.position = offset;
            lines.push("OK".into());
        } else if let Some(args) = command.strip_prefix("AT+QFREAD=") {
            let wanted: usize = args.split(',').nth(1).and_then(|v| v.parse().ok()).unwrap_or(0);
            let end = (file.position + wanted).min(file.bytes.len());
            let mut chunk = file.bytes[file.position..end].to_vec();
            if let Some(offset) = self.corrupt_at {
                if offset >= file.position && offset < end {
                    chunk[offset - file.position] ^= 0x01;
                }
            }
            file.position = end;
            raw = Some(chunk);
        } else if command.starts_with("AT+QFCLOSE") || command.starts_with("AT+QFDEL") {
            lines.push("OK".into());
        } else {
            return false;
        }

        if let Some(chunk) = raw {
            let header = format!("CONNECT {}\r\n", chunk.len());
            self.rx.extend(header.as_bytes());
            self.rx.extend(chunk);
            self.rx.extend(b"\r\nOK\r\n");
        }
        for line in lines {
            self.queue_line(&line);
        }
        true
    }
}

impl Transport for ScriptedModem {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        let command = String::from_utf8_lossy(bytes)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        self.log.push(command.clone());
        if self.echo {
            self.queue_line(&command);
        }
        if self.file_command(&command) {
            return Ok(());
        }
        let reply = self
            .rules
            .iter_mut()
            .find(|rule| command.starts_with(&rule.prefix))
            .map(|rule| rule.replies.pop_front().unwrap_or_else(|| rule.last.clone()));
        match reply {
            Some(lines) => {
                for line in lines {
                    self.queue_line(&line);
                }
            }
            None if self.default_ok => self.queue_line("OK"),
            None => {}
        }
        Ok(())
    }

    fn read_line(&mut self, _timeout: Duration) -> io::Result<Vec<u8>> {
        match self.rx.iter().position(|b| *b == b'\n') {
            Some(end) => Ok(self.rx.drain(..=end).collect()),
            None => Ok(self.rx.drain(..).collect()),
        }
    }

    fn read_exact_within(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
        let n = buf.len().min(self.rx.len());
        for (slot, byte) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn available(&mut self) -> usize {
        self.rx.len()
    }

    fn clear(&mut self) {
        self.rx.clear();
    }
}
