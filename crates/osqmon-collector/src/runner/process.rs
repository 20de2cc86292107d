use std::{
    collections::HashMap,
    io::{self, BufReader, Read},
    path::{Path, PathBuf},
    process::Stdio,
    time::{Duration, Instant},
};

use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{ChildStderr, Command},
    sync::mpsc,
    task,
};
use tracing::{debug, info};

use crate::{
    error::RunError,
    model::{ResultSet, Row},
};

const OUTPUT_CHUNK_SIZE: usize = 16 * 1024;
const STDERR_LIMIT: usize = 1024;

pub struct ProcessRunner {
    executable: PathBuf,
    timeout: Duration,
}

impl ProcessRunner {
    pub fn new(executable: &str, timeout: Duration) -> Result<Self, RunError> {
        let resolved =
            resolve_executable(executable).ok_or_else(|| RunError::ExecutableNotFound {
                name: executable.to_string(),
            })?;

        info!(
            executable = %resolved.display(),
            timeout = ?timeout,
            "creating process runner"
        );
        Ok(Self {
            executable: resolved,
            timeout,
        })
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    pub async fn run(&self, query: &str) -> Result<ResultSet, RunError> {
        let started_at = Instant::now();
        let mut child = Command::new(&self.executable)
            .arg("--json")
            .arg(query)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(RunError::Spawn)?;
        debug!(query = %query, pid = ?child.id(), "running query");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunError::Spawn(io::Error::other("stdout was not captured")))?;
        let stderr_task = tokio::spawn(read_stderr(child.stderr.take()));

        let outcome = tokio::time::timeout(self.timeout, async {
            let decoded = decode_rows(stdout).await;
            let status = child.wait().await.map_err(RunError::Io)?;
            Ok::<_, RunError>((decoded, status))
        })
        .await;

        let (decoded, status) = match outcome {
            Ok(result) => result?,
            Err(_) => {
                if let Err(err) = child.kill().await {
                    debug!(error = %err, "failed to kill timed out query process");
                }
                stderr_task.abort();
                return Err(RunError::Timeout(self.timeout));
            }
        };

        if !status.success() {
            let stderr = stderr_task.await.unwrap_or_default();
            return Err(RunError::ProcessFailed {
                status: status.to_string(),
                stderr,
            });
        }
        stderr_task.abort();

        let rows = decoded?;
        Ok(ResultSet::new(rows, started_at.elapsed()))
    }
}

// The JSON decoder runs on a blocking thread and pulls stdout chunks as they
// arrive, so decoding overlaps with the process still writing.
async fn decode_rows<R>(mut output: R) -> Result<Vec<Row>, RunError>
where
    R: AsyncRead + Unpin,
{
    let (sender, receiver) = mpsc::channel::<Vec<u8>>(8);
    let decoder = task::spawn_blocking(move || decode_stream(ChunkReader::new(receiver)));

    let mut buffer = vec![0_u8; OUTPUT_CHUNK_SIZE];
    let mut forwarding = true;
    loop {
        let read = output.read(&mut buffer).await.map_err(RunError::Io)?;
        if read == 0 {
            break;
        }
        // Keep draining after the decoder stops so the process never blocks on a full pipe.
        if forwarding && sender.send(buffer[..read].to_vec()).await.is_err() {
            forwarding = false;
        }
    }
    drop(sender);

    decoder
        .await
        .map_err(|err| RunError::DecodeError(format!("decoder task failed: {err}")))?
}

fn decode_stream(reader: impl Read) -> Result<Vec<Row>, RunError> {
    let mut values = serde_json::Deserializer::from_reader(BufReader::new(reader))
        .into_iter::<Vec<HashMap<String, Value>>>();

    let items = match values.next() {
        Some(Ok(items)) => items,
        Some(Err(err)) => return Err(RunError::DecodeError(err.to_string())),
        None => {
            return Err(RunError::DecodeError(
                "query produced no output".to_string(),
            ));
        }
    };

    items.into_iter().map(row_from_json).collect()
}

fn row_from_json(item: HashMap<String, Value>) -> Result<Row, RunError> {
    item.into_iter()
        .map(|(column, value)| {
            let text = match value {
                Value::String(text) => text,
                Value::Number(number) => number.to_string(),
                Value::Bool(flag) => flag.to_string(),
                Value::Null => String::new(),
                Value::Array(_) | Value::Object(_) => {
                    return Err(RunError::DecodeError(format!(
                        "column {column:?} holds a nested value"
                    )));
                }
            };
            Ok((column, text))
        })
        .collect()
}

struct ChunkReader {
    chunks: mpsc::Receiver<Vec<u8>>,
    current: Vec<u8>,
    offset: usize,
}

impl ChunkReader {
    fn new(chunks: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            chunks,
            current: Vec::new(),
            offset: 0,
        }
    }
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.offset >= self.current.len() {
            match self.chunks.blocking_recv() {
                Some(chunk) => {
                    self.current = chunk;
                    self.offset = 0;
                }
                None => return Ok(0),
            }
        }

        let available = &self.current[self.offset..];
        let len = available.len().min(buf.len());
        buf[..len].copy_from_slice(&available[..len]);
        self.offset += len;
        Ok(len)
    }
}

async fn read_stderr(stderr: Option<ChildStderr>) -> String {
    let Some(mut stderr) = stderr else {
        return String::new();
    };

    let mut output = Vec::new();
    if stderr.read_to_end(&mut output).await.is_err() {
        return String::new();
    }
    output.truncate(STDERR_LIMIT);
    String::from_utf8_lossy(&output).trim().to_string()
}

fn resolve_executable(name: &str) -> Option<PathBuf> {
    let candidate = Path::new(name);
    if candidate.is_absolute() || candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }

    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|path| is_executable(path))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|metadata| metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
