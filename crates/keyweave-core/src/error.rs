use thiserror::Error;

use crate::driver::DriverError;

/// A parse-time error. These are the only errors that stop a script from
/// running at all.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message} at line {line}")]
pub struct SyntaxError {
    pub line: usize,
    pub message: String,
}

impl SyntaxError {
    pub fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

/// Failure to dispatch a single command line. Logged by the executor,
/// never fatal to the run.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("{command} requires {what}")]
    MissingArgument {
        command: &'static str,
        what: &'static str,
    },

    #[error("{command}: invalid {what} '{value}'")]
    InvalidArgument {
        command: &'static str,
        what: &'static str,
        value: String,
    },

    #[error(transparent)]
    Driver(#[from] DriverError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syntax_error_mentions_line() {
        let e = SyntaxError::new(4, "While requires a condition");
        assert_eq!(e.to_string(), "While requires a condition at line 4");
    }

    #[test]
    fn test_command_error_display() {
        let e = CommandError::InvalidArgument {
            command: "click",
            what: "x coordinate",
            value: "abc".into(),
        };
        assert_eq!(e.to_string(), "click: invalid x coordinate 'abc'");
        assert_eq!(
            CommandError::UnknownCommand("foobar".into()).to_string(),
            "unknown command: foobar"
        );
    }
}
