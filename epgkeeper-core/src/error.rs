use crate::command_util;
use crate::models::ClientId;
use crate::models::TableId;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Table not found")]
    TableNotFound,
    #[error("Channel not bound to {0}")]
    ChannelNotBound(TableId),
    #[error("Provider not found for {0}")]
    ProviderNotFound(ClientId),
    #[error("Database not open")]
    DatabaseNotOpen,
    #[error("Timed out")]
    Timeout,
    #[error("Invalid provider output: {0}")]
    InvalidProviderOutput(String),
    #[error("Command failed: {0}")]
    CommandFailed(command_util::Error),
    #[error("std::io error: {0}")]
    IoError(std::io::Error),
    #[error("JSON error: {0}")]
    JsonError(serde_json::Error),
    #[error("YAML error: {0}")]
    YamlError(serde_yaml::Error),
    #[error("SQLite error: {0}")]
    SqliteError(rusqlite::Error),
    #[error("Mustache error: {0}")]
    MustacheError(mustache::Error),
    #[error(transparent)]
    AnyhowError(#[from] anyhow::Error),
}

impl From<command_util::Error> for Error {
    fn from(err: command_util::Error) -> Self {
        Self::CommandFailed(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonError(err)
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::YamlError(err)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::SqliteError(err)
    }
}

impl From<mustache::Error> for Error {
    fn from(err: mustache::Error) -> Self {
        Self::MustacheError(err)
    }
}

impl From<mustache::EncoderError> for Error {
    fn from(err: mustache::EncoderError) -> Self {
        Self::MustacheError(mustache::Error::from(err))
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::Timeout
    }
}
