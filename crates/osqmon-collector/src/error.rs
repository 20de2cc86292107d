use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunError {
    #[error("executable {name:?} not found or not executable")]
    ExecutableNotFound { name: String },
    #[error("failed to start query process: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("query process i/o error: {0}")]
    Io(#[source] std::io::Error),
    #[error("query timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to decode query output: {0}")]
    DecodeError(String),
    #[error("query process exited with {status}: {stderr}")]
    ProcessFailed { status: String, stderr: String },
    #[error("connection error: {0}")]
    ConnectionError(String),
    #[error("query failed with status {code}: {message}")]
    QueryFailed { code: i32, message: String },
}

#[derive(Debug, Error, PartialEq)]
pub enum MapError {
    #[error("scalar metric received {rows} rows, expected at most one")]
    TooManyRows { rows: usize },
    #[error("row {row} has no value column {column:?}")]
    MissingValueColumn { row: usize, column: String },
    #[error("row {row} value {value:?} in column {column:?} is not numeric")]
    NotNumeric {
        row: usize,
        column: String,
        value: String,
    },
    #[error("row {row} has no label column {column:?}")]
    MissingLabelColumn { row: usize, column: String },
}

#[derive(Debug, Error)]
pub enum CollectError {
    #[error(transparent)]
    Run(#[from] RunError),
    #[error(transparent)]
    Map(#[from] MapError),
    #[error("collection task aborted: {0}")]
    Aborted(String),
}
