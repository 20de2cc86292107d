use std::{
    collections::HashMap,
    net::Shutdown,
    os::unix::net::UnixStream,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use thrift::{
    ApplicationError, ApplicationErrorKind, ProtocolError, ProtocolErrorKind,
    protocol::{
        TBinaryInputProtocol, TBinaryOutputProtocol, TFieldIdentifier, TInputProtocol,
        TMessageIdentifier, TMessageType, TOutputProtocol, TStructIdentifier, TType,
    },
    transport::{TBufferedReadTransport, TBufferedWriteTransport},
};
use tokio::task;
use tracing::{debug, info};

use crate::error::RunError;

use super::connection::{ExtensionResponse, ExtensionStatus, QueryClient};

// Upper bound for preallocation; the reply still carries every row it declares.
const MAX_PREALLOCATED_ROWS: usize = 1024;

// Client for the `ExtensionManager.query` call of osqueryd's extension socket:
// Thrift binary protocol over a buffered Unix socket transport.
pub struct SocketClient {
    path: PathBuf,
    io_timeout: Duration,
    stream: Option<Arc<UnixStream>>,
    sequence: i32,
}

impl SocketClient {
    pub async fn connect(
        path: impl AsRef<Path>,
        io_timeout: Duration,
    ) -> Result<Self, RunError> {
        let mut client = Self {
            path: path.as_ref().to_path_buf(),
            io_timeout,
            stream: None,
            sequence: 0,
        };
        client.ensure_connected().await?;
        info!(socket = %client.path.display(), "connected to extension socket");
        Ok(client)
    }

    async fn ensure_connected(&mut self) -> Result<Arc<UnixStream>, RunError> {
        if let Some(stream) = &self.stream {
            return Ok(Arc::clone(stream));
        }

        let connect_error = |err: std::io::Error| {
            RunError::ConnectionError(format!(
                "cannot connect to {}: {err}",
                self.path.display()
            ))
        };
        let stream = tokio::time::timeout(
            self.io_timeout,
            tokio::net::UnixStream::connect(&self.path),
        )
        .await
        .map_err(|_| {
            RunError::ConnectionError(format!(
                "timed out connecting to {}",
                self.path.display()
            ))
        })?
        .map_err(connect_error)?;

        // The Thrift transport is blocking; reads and writes are bounded by the socket timeouts.
        let stream = stream.into_std().map_err(connect_error)?;
        stream.set_nonblocking(false).map_err(connect_error)?;
        stream
            .set_read_timeout(Some(self.io_timeout))
            .map_err(connect_error)?;
        stream
            .set_write_timeout(Some(self.io_timeout))
            .map_err(connect_error)?;

        let stream = Arc::new(stream);
        self.stream = Some(Arc::clone(&stream));
        Ok(stream)
    }
}

#[async_trait]
impl QueryClient for SocketClient {
    async fn query(&mut self, sql: &str) -> Result<ExtensionResponse, RunError> {
        let stream = self.ensure_connected().await?;
        self.sequence = self.sequence.wrapping_add(1);
        let sequence = self.sequence;
        let sql = sql.to_string();

        match task::spawn_blocking(move || call_query(&stream, sequence, &sql)).await {
            Ok(result) => result.map_err(run_error),
            Err(err) => Err(RunError::ConnectionError(format!(
                "extension call aborted: {err}"
            ))),
        }
    }

    async fn reset(&mut self) {
        if let Some(stream) = self.stream.take() {
            // Wakes a blocking call still waiting on the old connection.
            if let Err(err) = stream.shutdown(Shutdown::Both) {
                debug!(error = %err, "extension socket already closed");
            }
            debug!(socket = %self.path.display(), "dropping extension socket connection");
        }
    }
}

fn call_query(stream: &UnixStream, sequence: i32, sql: &str) -> thrift::Result<ExtensionResponse> {
    let mut output = TBinaryOutputProtocol::new(TBufferedWriteTransport::new(stream), true);
    output.write_message_begin(&TMessageIdentifier::new("query", TMessageType::Call, sequence))?;
    output.write_struct_begin(&TStructIdentifier::new("ExtensionManager_query_args"))?;
    output.write_field_begin(&TFieldIdentifier::new("sql", TType::String, 1))?;
    output.write_string(sql)?;
    output.write_field_end()?;
    output.write_field_stop()?;
    output.write_struct_end()?;
    output.write_message_end()?;
    output.flush()?;

    let mut input = TBinaryInputProtocol::new(TBufferedReadTransport::new(stream), false);
    let message = input.read_message_begin()?;
    if message.message_type == TMessageType::Exception {
        let reason = read_application_exception(&mut input)?;
        input.read_message_end()?;
        return Err(thrift::Error::Application(ApplicationError::new(
            ApplicationErrorKind::Unknown,
            reason,
        )));
    }
    if message.message_type != TMessageType::Reply
        || message.name != "query"
        || message.sequence_number != sequence
    {
        return Err(protocol_error(format!(
            "unexpected reply {:?} #{} to query #{sequence}",
            message.name, message.sequence_number
        )));
    }

    let response = read_query_result(&mut input)?;
    input.read_message_end()?;
    Ok(response)
}

fn read_query_result(input: &mut dyn TInputProtocol) -> thrift::Result<ExtensionResponse> {
    let mut success = None;
    input.read_struct_begin()?;
    loop {
        let field = input.read_field_begin()?;
        match (field.id, field.field_type) {
            (_, TType::Stop) => break,
            (Some(0), TType::Struct) => success = Some(read_extension_response(input)?),
            (_, field_type) => input.skip(field_type)?,
        }
        input.read_field_end()?;
    }
    input.read_struct_end()?;

    success.ok_or_else(|| protocol_error("query reply carries no result".to_string()))
}

fn read_extension_response(input: &mut dyn TInputProtocol) -> thrift::Result<ExtensionResponse> {
    let mut status = None;
    let mut rows = Vec::new();
    input.read_struct_begin()?;
    loop {
        let field = input.read_field_begin()?;
        match (field.id, field.field_type) {
            (_, TType::Stop) => break,
            (Some(1), TType::Struct) => status = Some(read_status(input)?),
            (Some(2), TType::List) => rows = read_rows(input)?,
            (_, field_type) => input.skip(field_type)?,
        }
        input.read_field_end()?;
    }
    input.read_struct_end()?;

    let status =
        status.ok_or_else(|| protocol_error("extension response has no status".to_string()))?;
    Ok(ExtensionResponse {
        status,
        response: rows,
    })
}

fn read_status(input: &mut dyn TInputProtocol) -> thrift::Result<ExtensionStatus> {
    let mut status = ExtensionStatus {
        code: 0,
        message: String::new(),
    };
    input.read_struct_begin()?;
    loop {
        let field = input.read_field_begin()?;
        match (field.id, field.field_type) {
            (_, TType::Stop) => break,
            (Some(1), TType::I32) => status.code = input.read_i32()?,
            (Some(2), TType::String) => status.message = input.read_string()?,
            (_, field_type) => input.skip(field_type)?,
        }
        input.read_field_end()?;
    }
    input.read_struct_end()?;
    Ok(status)
}

fn read_rows(input: &mut dyn TInputProtocol) -> thrift::Result<Vec<HashMap<String, String>>> {
    let list = input.read_list_begin()?;
    let mut rows = Vec::with_capacity(preallocation(list.size));
    for _ in 0..list.size {
        let map = input.read_map_begin()?;
        let mut row = HashMap::with_capacity(preallocation(map.size));
        for _ in 0..map.size {
            let column = input.read_string()?;
            let value = input.read_string()?;
            row.insert(column, value);
        }
        input.read_map_end()?;
        rows.push(row);
    }
    input.read_list_end()?;
    Ok(rows)
}

fn read_application_exception(input: &mut dyn TInputProtocol) -> thrift::Result<String> {
    let mut reason = String::new();
    input.read_struct_begin()?;
    loop {
        let field = input.read_field_begin()?;
        match (field.id, field.field_type) {
            (_, TType::Stop) => break,
            (Some(1), TType::String) => reason = input.read_string()?,
            (_, field_type) => input.skip(field_type)?,
        }
        input.read_field_end()?;
    }
    input.read_struct_end()?;
    Ok(reason)
}

fn preallocation(size: i32) -> usize {
    usize::try_from(size).unwrap_or(0).min(MAX_PREALLOCATED_ROWS)
}

fn protocol_error(message: String) -> thrift::Error {
    thrift::Error::Protocol(ProtocolError::new(ProtocolErrorKind::InvalidData, message))
}

fn run_error(err: thrift::Error) -> RunError {
    match err {
        thrift::Error::Transport(err) => RunError::ConnectionError(err.to_string()),
        thrift::Error::Application(err) => {
            RunError::ConnectionError(format!("extension manager rejected the call: {err}"))
        }
        other => RunError::DecodeError(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::Read,
        os::unix::net::{UnixListener, UnixStream},
        sync::mpsc,
        thread,
        time::{Duration, Instant},
    };

    use tempfile::TempDir;
    use thrift::protocol::{
        TBinaryInputProtocol, TBinaryOutputProtocol, TFieldIdentifier, TInputProtocol,
        TListIdentifier, TMapIdentifier, TMessageIdentifier, TMessageType, TOutputProtocol,
        TStructIdentifier, TType,
    };
    use thrift::transport::{TBufferedReadTransport, TBufferedWriteTransport};

    use crate::{
        error::RunError,
        runner::connection::{EXT_FAILED, EXT_SUCCESS, QueryClient},
    };

    use super::SocketClient;

    type Rows = Vec<Vec<(&'static str, &'static str)>>;

    fn read_call(input: &mut dyn TInputProtocol) -> thrift::Result<(String, i32, String)> {
        let message = input.read_message_begin()?;
        let mut sql = String::new();
        input.read_struct_begin()?;
        loop {
            let field = input.read_field_begin()?;
            match (field.id, field.field_type) {
                (_, TType::Stop) => break,
                (Some(1), TType::String) => sql = input.read_string()?,
                (_, field_type) => input.skip(field_type)?,
            }
            input.read_field_end()?;
        }
        input.read_struct_end()?;
        input.read_message_end()?;
        Ok((message.name, message.sequence_number, sql))
    }

    fn write_reply(
        output: &mut dyn TOutputProtocol,
        sequence: i32,
        code: i32,
        message: &str,
        rows: &Rows,
    ) -> thrift::Result<()> {
        output.write_message_begin(&TMessageIdentifier::new(
            "query",
            TMessageType::Reply,
            sequence,
        ))?;
        output.write_struct_begin(&TStructIdentifier::new("ExtensionManager_query_result"))?;
        output.write_field_begin(&TFieldIdentifier::new("success", TType::Struct, 0))?;
        output.write_struct_begin(&TStructIdentifier::new("ExtensionResponse"))?;

        output.write_field_begin(&TFieldIdentifier::new("status", TType::Struct, 1))?;
        output.write_struct_begin(&TStructIdentifier::new("ExtensionStatus"))?;
        output.write_field_begin(&TFieldIdentifier::new("code", TType::I32, 1))?;
        output.write_i32(code)?;
        output.write_field_end()?;
        output.write_field_begin(&TFieldIdentifier::new("message", TType::String, 2))?;
        output.write_string(message)?;
        output.write_field_end()?;
        output.write_field_begin(&TFieldIdentifier::new("uuid", TType::I64, 3))?;
        output.write_i64(42)?;
        output.write_field_end()?;
        output.write_field_stop()?;
        output.write_struct_end()?;
        output.write_field_end()?;

        output.write_field_begin(&TFieldIdentifier::new("response", TType::List, 2))?;
        output.write_list_begin(&TListIdentifier::new(TType::Map, rows.len() as i32))?;
        for row in rows {
            output.write_map_begin(&TMapIdentifier::new(
                TType::String,
                TType::String,
                row.len() as i32,
            ))?;
            for (column, value) in row {
                output.write_string(column)?;
                output.write_string(value)?;
            }
            output.write_map_end()?;
        }
        output.write_list_end()?;
        output.write_field_end()?;

        output.write_field_stop()?;
        output.write_struct_end()?;
        output.write_field_end()?;
        output.write_field_stop()?;
        output.write_struct_end()?;
        output.write_message_end()?;
        output.flush()
    }

    // Serves connections one after another; every call is answered by `answer`
    // and the received SQL is forwarded to the returned channel.
    fn extension_manager(
        listener: UnixListener,
        answer: fn(&str) -> (i32, &'static str, Rows),
    ) -> mpsc::Receiver<String> {
        let (sender, receiver) = mpsc::channel();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else {
                    return;
                };
                let mut input =
                    TBinaryInputProtocol::new(TBufferedReadTransport::new(&stream), true);
                let mut output =
                    TBinaryOutputProtocol::new(TBufferedWriteTransport::new(&stream), true);
                while let Ok((name, sequence, sql)) = read_call(&mut input) {
                    assert_eq!(name, "query");
                    let (code, message, rows) = answer(&sql);
                    if sender.send(sql).is_err()
                        || write_reply(&mut output, sequence, code, message, &rows).is_err()
                    {
                        break;
                    }
                }
            }
        });
        receiver
    }

    fn osquery_answers(sql: &str) -> (i32, &'static str, Rows) {
        match sql {
            "SELECT name, pid FROM processes" => (
                EXT_SUCCESS,
                "OK",
                vec![
                    vec![("name", "osqueryd"), ("pid", "1")],
                    vec![("name", "sshd"), ("pid", "42")],
                ],
            ),
            _ => (EXT_FAILED, "no such table: nope", Vec::new()),
        }
    }

    #[tokio::test]
    async fn queries_the_extension_manager() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("osquery.em");
        let seen = extension_manager(UnixListener::bind(&path).unwrap(), osquery_answers);

        let mut client = SocketClient::connect(&path, Duration::from_secs(2))
            .await
            .unwrap();

        let response = client.query("SELECT name, pid FROM processes").await.unwrap();
        assert_eq!(response.status.code, EXT_SUCCESS);
        assert_eq!(response.response.len(), 2);
        assert_eq!(response.response[1]["name"], "sshd");
        assert_eq!(response.response[1]["pid"], "42");

        let failed = client.query("SELECT * FROM nope").await.unwrap();
        assert_eq!(failed.status.code, EXT_FAILED);
        assert_eq!(failed.status.message, "no such table: nope");
        assert!(failed.response.is_empty());

        assert_eq!(seen.recv().unwrap(), "SELECT name, pid FROM processes");
        assert_eq!(seen.recv().unwrap(), "SELECT * FROM nope");
    }

    #[tokio::test]
    async fn writes_strict_binary_call_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("osquery.em");
        let listener = UnixListener::bind(&path).unwrap();
        let (sender, receiver) = mpsc::channel();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut header = [0_u8; 4];
            stream.read_exact(&mut header).unwrap();
            sender.send(header).unwrap();
        });

        let mut client = SocketClient::connect(&path, Duration::from_secs(2))
            .await
            .unwrap();
        let err = client.query("SELECT 1").await.unwrap_err();

        assert_eq!(receiver.recv().unwrap(), [0x80, 0x01, 0x00, 0x01]);
        assert!(matches!(err, RunError::ConnectionError(_)));
    }

    #[tokio::test]
    async fn connect_fails_for_missing_socket() {
        let dir = TempDir::new().unwrap();
        let err =
            SocketClient::connect(dir.path().join("missing.em"), Duration::from_secs(1)).await;
        assert!(matches!(err, Err(RunError::ConnectionError(_))));
    }

    #[tokio::test]
    async fn silent_manager_fails_within_io_timeout() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("osquery.em");
        let listener = UnixListener::bind(&path).unwrap();
        let (keep, held) = mpsc::channel::<UnixStream>();
        thread::spawn(move || {
            if let Ok((stream, _)) = listener.accept() {
                let _ = keep.send(stream);
            }
        });

        let mut client = SocketClient::connect(&path, Duration::from_millis(200))
            .await
            .unwrap();
        let started = Instant::now();
        let err = client.query("SELECT 1").await.unwrap_err();

        assert!(matches!(err, RunError::ConnectionError(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
        drop(held);
    }

    #[tokio::test]
    async fn reconnects_after_reset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("osquery.em");
        let seen = extension_manager(UnixListener::bind(&path).unwrap(), osquery_answers);

        let mut client = SocketClient::connect(&path, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(client.query("SELECT name, pid FROM processes").await.is_ok());
        client.reset().await;
        let response = client.query("SELECT name, pid FROM processes").await.unwrap();
        assert_eq!(response.response.len(), 2);
        assert_eq!(seen.iter().take(2).count(), 2);
    }
}
