//! Response line classification.
//!
//! Every line read during a transaction is run through [`MATCHERS`] in order. A line can
//! trigger several actions; the engine decides which of them end processing of the line.
//!
//! ```text
//! priority  pattern                                   action
//! 1         "ERROR"                                   Fail
//! 2         "APP RDY" | "+QMTSTAT:" | pdpdeact URC    LatchDisconnect
//! 3         "+QMTRECV:"                               ForwardPublish
//! 4         "+QNTP: 0,"                               ApplyNetworkTime
//! 5         <expected token>                          MatchExpected
//! 6         "OK"                                      MatchOk
//! ```

pub const ERROR_MARKER: &str = "ERROR";
pub const DISCONNECT_MARKERS: [&str; 3] = ["APP RDY", "+QMTSTAT:", "+QIURC: \"pdpdeact\""];
pub const PUBLISH_MARKER: &str = "+QMTRECV:";
pub const NTP_MARKER: &str = "+QNTP: 0,";
pub const OK_MARKER: &str = "OK";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineAction {
    Fail,
    LatchDisconnect,
    ForwardPublish,
    ApplyNetworkTime,
    MatchExpected,
    MatchOk,
}

#[derive(Debug, Clone, Copy)]
enum Pattern {
    Contains(&'static str),
    AnyOf(&'static [&'static str]),
    Expected,
    Exact(&'static str),
}

#[derive(Debug, Clone, Copy)]
pub struct Matcher {
    pub action: LineAction,
    pattern: Pattern,
}

impl Matcher {
    pub fn matches(&self, line: &str, expected: &str) -> bool {
        match self.pattern {
            Pattern::Contains(token) => line.contains(token),
            Pattern::AnyOf(tokens) => tokens.iter().any(|t| line.contains(t)),
            Pattern::Expected => !expected.is_empty() && line.contains(expected),
            Pattern::Exact(token) => !expected.is_empty() && line.trim() == token,
        }
    }
}

pub static MATCHERS: [Matcher; 6] = [
    Matcher {
        action: LineAction::Fail,
        pattern: Pattern::Contains(ERROR_MARKER),
    },
    Matcher {
        action: LineAction::LatchDisconnect,
        pattern: Pattern::AnyOf(&DISCONNECT_MARKERS),
    },
    Matcher {
        action: LineAction::ForwardPublish,
        pattern: Pattern::Contains(PUBLISH_MARKER),
    },
    Matcher {
        action: LineAction::ApplyNetworkTime,
        pattern: Pattern::Contains(NTP_MARKER),
    },
    Matcher {
        action: LineAction::MatchExpected,
        pattern: Pattern::Expected,
    },
    Matcher {
        action: LineAction::MatchOk,
        pattern: Pattern::Exact(OK_MARKER),
    },
];

/// Actions triggered by `line`, highest priority first.
///
/// With an empty `expected` (unsolicited polling) the transaction-bound matchers never fire.
pub fn classify<'a>(line: &'a str, expected: &'a str) -> impl Iterator<Item = LineAction> + 'a {
    MATCHERS
        .iter()
        .filter(move |m| m.matches(line, expected))
        .map(|m| m.action)
}
