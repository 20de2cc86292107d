use osqmon_collector::{
    Runner,
    runner::{ConnectionRunner, ProcessRunner},
};
use osqmon_common::error::{OsqmonError, Result};
use tracing::info;

use crate::config::RunnerSettings;

pub async fn build_runner(settings: &RunnerSettings) -> Result<Runner> {
    match settings {
        RunnerSettings::Process { binary, timeout } => {
            let runner = ProcessRunner::new(binary, *timeout).map_err(|err| {
                OsqmonError::InvalidConfig(format!("runtime.osquery: {err}"))
            })?;
            Ok(Runner::from(runner))
        }
        RunnerSettings::Socket { path, timeout } => connect_socket(path, *timeout).await,
    }
}

#[cfg(unix)]
async fn connect_socket(path: &std::path::Path, timeout: std::time::Duration) -> Result<Runner> {
    use osqmon_collector::runner::SocketClient;

    let client = SocketClient::connect(path, timeout)
        .await
        .map_err(|err| OsqmonError::InvalidConfig(format!("socket.path: {err}")))?;
    info!(socket = %path.display(), "using extension socket runner");
    Ok(Runner::from(ConnectionRunner::new(
        path.display().to_string(),
        Box::new(client),
        timeout,
    )))
}

#[cfg(not(unix))]
async fn connect_socket(path: &std::path::Path, _timeout: std::time::Duration) -> Result<Runner> {
    Err(OsqmonError::InvalidConfig(format!(
        "socket.path: {} cannot be used, extension sockets need a unix platform",
        path.display()
    )))
}
