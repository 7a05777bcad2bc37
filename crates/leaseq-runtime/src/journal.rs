//! Line codec for durable log records.
//!
//! A record is one line of six fields joined by [`RECORD_SEPARATOR`]:
//!
//! ```text
//! OPERATION#$recorded_at#$uri#$handle#$content#$visibility_timestamp
//! ```
//!
//! Records never contain the separator or a line break, so a line always
//! splits back into exactly six fields.

use crate::error::{QueueError, ValidationError};
use crate::message::{Message, QueueName};
use std::fmt;
use std::str::FromStr;

#[cfg(test)]
#[path = "journal_tests.rs"]
mod tests;

/// Field separator inside a record line
pub const RECORD_SEPARATOR: &str = "#$";

const FIELD_COUNT: usize = 6;

/// Operation captured by a log record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Push,
    Pull,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Push => "PUSH",
            Self::Pull => "PULL",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PUSH" => Ok(Self::Push),
            "PULL" => Ok(Self::Pull),
            "DELETE" => Ok(Self::Delete),
            other => Err(format!("unknown operation '{}'", other)),
        }
    }
}

/// One entry of the append-only log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub operation: Operation,
    /// When the operation was issued (ms)
    pub recorded_at: i64,
    pub message: Message,
}

impl LogRecord {
    pub fn new(operation: Operation, recorded_at: i64, message: Message) -> Self {
        Self {
            operation,
            recorded_at,
            message,
        }
    }

    /// Encode as a single line, without the trailing newline
    pub fn encode(&self) -> Result<String, QueueError> {
        let message = &self.message;
        check_field("uri", message.uri.as_str())?;
        check_field("handle", &message.handle)?;
        check_field("content", &message.content)?;

        Ok([
            self.operation.as_str(),
            &self.recorded_at.to_string(),
            message.uri.as_str(),
            &message.handle,
            &message.content,
            &message.visibility_timestamp.to_string(),
        ]
        .join(RECORD_SEPARATOR))
    }

    /// Decode a line (without its newline). `line_number` is 1-based and only
    /// used for error reporting.
    pub fn decode(line: &str, line_number: usize) -> Result<Self, QueueError> {
        let corrupt = |message: String| QueueError::CorruptRecord {
            line: line_number,
            message,
        };

        let fields: Vec<&str> = line.split(RECORD_SEPARATOR).collect();
        if fields.len() != FIELD_COUNT {
            return Err(corrupt(format!(
                "expected {} fields, found {}",
                FIELD_COUNT,
                fields.len()
            )));
        }

        let operation: Operation = fields[0].parse().map_err(corrupt)?;
        let recorded_at = parse_timestamp("recorded_at", fields[1]).map_err(corrupt)?;
        let uri = QueueName::new(fields[2].to_string()).map_err(|e| corrupt(e.to_string()))?;
        let visibility_timestamp =
            parse_timestamp("visibility_timestamp", fields[5]).map_err(corrupt)?;

        Ok(Self {
            operation,
            recorded_at,
            message: Message::new(
                uri,
                fields[3].to_string(),
                fields[4].to_string(),
                visibility_timestamp,
            ),
        })
    }
}

fn check_field(field: &str, value: &str) -> Result<(), ValidationError> {
    if value.contains(RECORD_SEPARATOR) || value.contains(['\n', '\r']) {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            message: format!(
                "must not contain '{}' or line breaks",
                RECORD_SEPARATOR
            ),
        });
    }
    Ok(())
}

fn parse_timestamp(field: &str, value: &str) -> Result<i64, String> {
    value
        .parse::<i64>()
        .map_err(|e| format!("invalid {} '{}': {}", field, value, e))
}
