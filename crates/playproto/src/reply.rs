//! Reply vocabulary. Every reply is text starting with `OK` or `FAIL`.

use std::fmt;

/// Body of the reply to any line the dispatcher cannot route.
pub const INVALID_MESSAGE: &str = "Message is Invalid";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `OK` or `OK <text>`
    Ok(Option<String>),
    /// `OK` followed by one line per entry, newline separated
    Lines(Vec<String>),
    /// `FAIL <text>`
    Fail(String),
}

impl Reply {
    pub fn ok() -> Self {
        Self::Ok(None)
    }

    pub fn ok_with(text: impl Into<String>) -> Self {
        Self::Ok(Some(text.into()))
    }

    pub fn fail(text: impl Into<String>) -> Self {
        Self::Fail(text.into())
    }

    pub fn invalid() -> Self {
        Self::Fail(INVALID_MESSAGE.to_string())
    }

    pub fn is_ok(&self) -> bool {
        !matches!(self, Self::Fail(_))
    }

    /// Classify a received reply by its leading token.
    ///
    /// Returns `None` for text that starts with neither `OK` nor `FAIL`.
    pub fn parse(text: &str) -> Option<Self> {
        if let Some(rest) = text.strip_prefix("FAIL") {
            return match rest.strip_prefix([' ', '\n']) {
                Some(body) => Some(Self::Fail(body.to_string())),
                None if rest.is_empty() => Some(Self::Fail(String::new())),
                None => None,
            };
        }

        let rest = text.strip_prefix("OK")?;
        if rest.is_empty() {
            Some(Self::Ok(None))
        } else if let Some(body) = rest.strip_prefix('\n') {
            Some(Self::Lines(body.split('\n').map(str::to_string).collect()))
        } else {
            rest.strip_prefix(' ')
                .map(|body| Self::Ok(Some(body.to_string())))
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok(None) => write!(f, "OK"),
            Self::Ok(Some(text)) => write!(f, "OK {}", text),
            Self::Lines(lines) if lines.is_empty() => write!(f, "OK"),
            Self::Lines(lines) => write!(f, "OK\n{}", lines.join("\n")),
            Self::Fail(text) => write!(f, "FAIL {}", text),
        }
    }
}

impl From<Reply> for String {
    fn from(reply: Reply) -> Self {
        reply.to_string()
    }
}
