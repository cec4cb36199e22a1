use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::BrokerError;

/// A validated topic name.
///
/// Topic names become directory names on disk, so the allowed alphabet is
/// restricted to lowercase letters, digits, `-`, `.` and `_`. Validation
/// happens once at construction and is fatal if violated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicName(String);

impl TopicName {
    pub fn new(name: impl Into<String>) -> Result<Self, BrokerError> {
        let name = name.into();
        if name.is_empty() || !name.bytes().all(valid_name_byte) {
            return Err(BrokerError::InvalidTopicName(name));
        }
        Ok(TopicName(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A validated consumer-group name.
///
/// Group names back the per-group offset files, so they share the topic
/// name alphabet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupName(String);

impl GroupName {
    pub fn new(name: impl Into<String>) -> Result<Self, BrokerError> {
        let name = name.into();
        if name.is_empty() || !name.bytes().all(valid_name_byte) {
            return Err(BrokerError::InvalidGroupName(name));
        }
        Ok(GroupName(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn valid_name_byte(b: u8) -> bool {
    b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'-' | b'.' | b'_')
}
