use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("invalid topic name '{0}'")]
    InvalidTopicName(String),

    #[error("invalid group name '{0}'")]
    InvalidGroupName(String),

    #[error("topic '{0}' not found")]
    TopicNotFound(String),

    #[error("offset {offset} is past the end of the log (next offset is {next})")]
    OffsetOutOfRange { offset: u64, next: u64 },

    #[error("stop may only be called once")]
    AlreadyStopped,

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("no connected client with id {0}")]
    ClientNotFound(u64),

    #[error("invalid envelope header: {0}")]
    InvalidHeader(String),

    #[error("envelope version must be exactly 4 ASCII characters, got '{0}'")]
    InvalidVersion(String),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
}
