use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::value_objects::TopicName;

/// A single record in a topic's log.
///
/// `offset` and `timestamp` are assigned by the log at produce time and are
/// `None` until then. An absent body is stored canonically as zero bytes, so
/// an empty `body` and "no body" are indistinguishable on read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub offset: Option<u64>,
    pub timestamp: Option<DateTime<Utc>>,
    pub meta: String,
    pub body: Vec<u8>,
}

impl Message {
    pub fn new(meta: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            offset: None,
            timestamp: None,
            meta: meta.into(),
            body: body.into(),
        }
    }
}

/// Administrative view of one topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicStats {
    pub name: TopicName,
    pub storage_directory: PathBuf,
    pub message_count: u64,
}
