use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{error::RunError, model::ResultSet};

// Mirrors the osquery extension status codes.
pub const EXT_SUCCESS: i32 = 0;
pub const EXT_FAILED: i32 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct ExtensionStatus {
    pub code: i32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtensionResponse {
    pub status: ExtensionStatus,
    pub response: Vec<HashMap<String, String>>,
}

impl ExtensionResponse {
    pub fn success(rows: Vec<HashMap<String, String>>) -> Self {
        Self {
            status: ExtensionStatus {
                code: EXT_SUCCESS,
                message: "OK".to_string(),
            },
            response: rows,
        }
    }

    pub fn failure(code: i32, message: impl Into<String>) -> Self {
        Self {
            status: ExtensionStatus {
                code,
                message: message.into(),
            },
            response: Vec::new(),
        }
    }
}

#[async_trait]
pub trait QueryClient: Send {
    async fn query(&mut self, sql: &str) -> Result<ExtensionResponse, RunError>;

    // Called after a timed out or failed call; the transport may hold a half-read reply.
    async fn reset(&mut self) {}
}

pub struct ConnectionRunner {
    target: String,
    timeout: Duration,
    client: Mutex<Box<dyn QueryClient>>,
}

impl ConnectionRunner {
    pub fn new(target: impl Into<String>, client: Box<dyn QueryClient>, timeout: Duration) -> Self {
        let target = target.into();
        info!(target = %target, timeout = ?timeout, "creating connection runner");
        Self {
            target,
            timeout,
            client: Mutex::new(client),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    // Calls are serialized: the backend connection carries one request at a time.
    pub async fn run(&self, query: &str) -> Result<ResultSet, RunError> {
        let mut client = self.client.lock().await;
        let started_at = Instant::now();
        debug!(query = %query, target = %self.target, "running query");

        let response = match tokio::time::timeout(self.timeout, client.query(query)).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                client.reset().await;
                return Err(err);
            }
            Err(_) => {
                client.reset().await;
                return Err(RunError::Timeout(self.timeout));
            }
        };

        if response.status.code != EXT_SUCCESS {
            return Err(RunError::QueryFailed {
                code: response.status.code,
                message: response.status.message,
            });
        }

        Ok(ResultSet::new(response.response, started_at.elapsed()))
    }
}
