//! Command lines: `VERB` or `VERB argument`.

use std::fmt;

use crate::ProtocolError;

/// One parsed request line.
///
/// The verb is one or more ASCII uppercase letters. Anything after it must be
/// a single space followed by a non-empty argument, which may itself contain
/// spaces and newlines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub verb: String,
    pub argument: Option<String>,
}

impl Command {
    pub fn new(verb: impl Into<String>, argument: Option<impl Into<String>>) -> Self {
        Self {
            verb: verb.into(),
            argument: argument.map(Into::into),
        }
    }

    /// Parse a request line.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        if line.is_empty() {
            return Err(ProtocolError::Empty);
        }

        let verb_len = line.bytes().take_while(u8::is_ascii_uppercase).count();
        if verb_len == 0 {
            return Err(ProtocolError::InvalidVerb);
        }

        let (verb, rest) = line.split_at(verb_len);
        if rest.is_empty() {
            return Ok(Self {
                verb: verb.to_string(),
                argument: None,
            });
        }

        match rest.strip_prefix(' ') {
            Some("") => Err(ProtocolError::MissingArgument),
            Some(argument) => Ok(Self {
                verb: verb.to_string(),
                argument: Some(argument.to_string()),
            }),
            // verb ran into something that is neither a space nor an uppercase letter
            None => Err(ProtocolError::InvalidVerb),
        }
    }

    /// Parse raw bytes off the wire.
    pub fn parse_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let line = std::str::from_utf8(bytes).map_err(|_| ProtocolError::Utf8)?;
        Self::parse(line)
    }

    /// Canonical line for this command.
    pub fn to_line(&self) -> String {
        match &self.argument {
            Some(argument) => format!("{} {}", self.verb, argument),
            None => self.verb.clone(),
        }
    }

    /// The argument, or "" when absent.
    pub fn argument_or_empty(&self) -> &str {
        self.argument.as_deref().unwrap_or("")
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}
