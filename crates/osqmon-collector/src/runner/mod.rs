pub mod connection;
pub mod process;
#[cfg(unix)]
pub mod socket;

use crate::{error::RunError, model::ResultSet};

pub use connection::{ConnectionRunner, ExtensionResponse, ExtensionStatus, QueryClient};
pub use process::ProcessRunner;
#[cfg(unix)]
pub use socket::SocketClient;

pub enum Runner {
    Process(ProcessRunner),
    Connection(ConnectionRunner),
}

impl Runner {
    pub async fn run(&self, query: &str) -> Result<ResultSet, RunError> {
        match self {
            Self::Process(runner) => runner.run(query).await,
            Self::Connection(runner) => runner.run(query).await,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Process(runner) => format!("process {}", runner.executable().display()),
            Self::Connection(runner) => format!("connection {}", runner.target()),
        }
    }
}

impl From<ProcessRunner> for Runner {
    fn from(runner: ProcessRunner) -> Self {
        Self::Process(runner)
    }
}

impl From<ConnectionRunner> for Runner {
    fn from(runner: ConnectionRunner) -> Self {
        Self::Connection(runner)
    }
}
