//! Line-oriented wire commands.
//!
//! A command is one `\r\n`-terminated line: an uppercase name followed by
//! space-separated parameters. Payload-carrying commands declare the payload
//! length as their final parameter; the payload bytes follow the line with
//! no extra delimiter.

use thiserror::Error;

/// Command parsing errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    /// Empty command line
    #[error("empty command line")]
    Empty,

    /// Command name contains characters outside `[A-Z0-9]`
    #[error("illegal command name: {0:?}")]
    IllegalName(String),

    /// A declared payload length did not parse as an integer
    #[error("bad payload length: {0:?}")]
    BadPayloadLength(String),
}

/// A single wire command: name, ordered parameters, optional payload.
///
/// Inbound commands are immutable once dispatched. The transaction id, when
/// present, is carried as the first parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Command name (e.g. `MSG`, `ACK`, `NAK`)
    pub name: String,
    /// Ordered parameter list, transaction id included if any
    pub params: Vec<String>,
    /// Payload bytes, filled in once the declared length has arrived
    pub payload: Option<Vec<u8>>,
}

impl Command {
    /// Create an outbound command.
    #[must_use]
    pub fn new(name: &str, params: Vec<String>) -> Self {
        Self {
            name: name.to_owned(),
            params,
            payload: None,
        }
    }

    /// Parse a command from one wire line (without the trailing `\r\n`).
    pub fn from_line(line: &str) -> Result<Self, CommandError> {
        let mut tokens = line.split(' ').filter(|t| !t.is_empty());
        let name = tokens.next().ok_or(CommandError::Empty)?;
        if name.is_empty() || !name.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()) {
            return Err(CommandError::IllegalName(name.to_owned()));
        }
        Ok(Self {
            name: name.to_owned(),
            params: tokens.map(str::to_owned).collect(),
            payload: None,
        })
    }

    /// Serialize the command line, including the trailing `\r\n` but not
    /// the payload.
    #[must_use]
    pub fn to_line(&self) -> String {
        let mut line = self.name.clone();
        for p in &self.params {
            line.push(' ');
            line.push_str(p);
        }
        line.push_str("\r\n");
        line
    }

    /// Transaction id, if the first parameter is numeric.
    #[must_use]
    pub fn trid(&self) -> Option<u32> {
        self.params.first().and_then(|p| p.parse().ok())
    }

    /// Declared payload length for payload-carrying commands (final
    /// parameter).
    pub fn declared_payload_len(&self) -> Result<usize, CommandError> {
        let last = self
            .params
            .last()
            .ok_or_else(|| CommandError::BadPayloadLength(String::new()))?;
        last.parse()
            .map_err(|_| CommandError::BadPayloadLength(last.clone()))
    }

    /// Numeric reply commands (three-digit error codes) parse to their code.
    #[must_use]
    pub fn error_code(&self) -> Option<u32> {
        if self.name.len() == 3 && self.name.chars().all(|c| c.is_ascii_digit()) {
            self.name.parse().ok()
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple() {
        let cmd = Command::from_line("ACK 12").unwrap();
        assert_eq!(cmd.name, "ACK");
        assert_eq!(cmd.params, vec!["12"]);
        assert_eq!(cmd.trid(), Some(12));
    }

    #[test]
    fn parse_payload_command() {
        let cmd = Command::from_line("MSG alice@example.com Alice 135").unwrap();
        assert_eq!(cmd.name, "MSG");
        assert_eq!(cmd.params.len(), 3);
        assert_eq!(cmd.declared_payload_len().unwrap(), 135);
        assert_eq!(cmd.trid(), None);
    }

    #[test]
    fn reject_empty_and_lowercase() {
        assert_eq!(Command::from_line("").unwrap_err(), CommandError::Empty);
        assert!(matches!(
            Command::from_line("msg 1 N 10"),
            Err(CommandError::IllegalName(_))
        ));
    }

    #[test]
    fn roundtrip_line() {
        let cmd = Command::new("MSG", vec!["7".into(), "D".into(), "64".into()]);
        assert_eq!(cmd.to_line(), "MSG 7 D 64\r\n");
        let parsed = Command::from_line(cmd.to_line().trim_end()).unwrap();
        assert_eq!(parsed.name, cmd.name);
        assert_eq!(parsed.params, cmd.params);
    }

    #[test]
    fn error_code_replies() {
        assert_eq!(Command::from_line("217 5").unwrap().error_code(), Some(217));
        assert_eq!(Command::from_line("ACK 5").unwrap().error_code(), None);
    }
}
