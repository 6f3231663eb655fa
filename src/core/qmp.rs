//! QEMU Machine Protocol and guest-agent clients over Unix sockets.

use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{Value, json};

use crate::error::{Error, Result};

struct Connection {
    stream: UnixStream,
    reader: BufReader<UnixStream>,
}

/// A lazily opened QMP session. QEMU serves one monitor client at a time, so each VM gets exactly
/// one `QmpClient` and every command goes through it.
pub struct QmpClient {
    vm: String,
    socket: PathBuf,
    timeout: Duration,
    connection: Option<Connection>,
}

impl QmpClient {
    pub fn new(vm: impl Into<String>, socket: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            vm: vm.into(),
            socket: socket.into(),
            timeout,
            connection: None,
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    fn protocol_error(&self, message: impl Into<String>) -> Error {
        Error::ControlProtocol {
            vm: self.vm.clone(),
            message: message.into(),
        }
    }

    /// True if a monitor session is open or can be opened now.
    pub fn reachable(&mut self) -> bool {
        match self.connect() {
            Ok(()) => true,
            Err(err) => {
                tracing::trace!(vm = %self.vm, error = %err, "QMP not reachable");
                false
            }
        }
    }

    fn connect(&mut self) -> Result<()> {
        if self.connection.is_some() {
            return Ok(());
        }
        if !self.socket.exists() {
            return Err(self.protocol_error(format!(
                "QMP socket {} does not exist",
                self.socket.display()
            )));
        }

        let io_error = |err: io::Error| {
            self.protocol_error(format!("QMP connection via {}: {err}", self.socket.display()))
        };
        let stream = UnixStream::connect(&self.socket).map_err(io_error)?;
        stream.set_read_timeout(Some(self.timeout)).map_err(io_error)?;
        stream.set_write_timeout(Some(self.timeout)).map_err(io_error)?;
        let reader = BufReader::new(stream.try_clone().map_err(io_error)?);
        let mut connection = Connection { stream, reader };

        let greeting = read_message(&mut connection.reader).map_err(|err| self.protocol_error(err))?;
        if greeting.get("QMP").is_none() {
            return Err(self.protocol_error(format!(
                "unexpected QMP greeting from {}",
                self.socket.display()
            )));
        }
        send(&mut connection.stream, &json!({ "execute": "qmp_capabilities" }))
            .map_err(|err| self.protocol_error(err))?;
        wait_for_return(&mut connection.reader).map_err(|err| self.protocol_error(err))?;

        self.connection = Some(connection);
        Ok(())
    }

    pub fn disconnect(&mut self) {
        self.connection = None;
    }

    /// Runs one command and returns its `return` value. Transport failures drop the session so
    /// the next command reconnects.
    pub fn execute(&mut self, command: &str, arguments: Option<Value>) -> Result<Value> {
        self.connect()?;
        let mut payload = json!({ "execute": command });
        if let (Some(arguments), Some(map)) = (arguments, payload.as_object_mut()) {
            map.insert("arguments".to_string(), arguments);
        }
        tracing::trace!(vm = %self.vm, command, "QMP command");

        let result = match self.connection.as_mut() {
            Some(connection) => send(&mut connection.stream, &payload)
                .and_then(|()| wait_for_return(&mut connection.reader)),
            None => Err("no QMP session".to_string()),
        };
        result.map_err(|message| {
            self.disconnect();
            self.protocol_error(format!("`{command}`: {message}"))
        })
    }
}

fn send(stream: &mut UnixStream, payload: &Value) -> std::result::Result<(), String> {
    let mut data = serde_json::to_string(payload).map_err(|err| err.to_string())?;
    data.push('\n');
    stream
        .write_all(data.as_bytes())
        .map_err(|err| err.to_string())
}

fn read_message(reader: &mut impl BufRead) -> std::result::Result<Value, String> {
    let mut line = String::new();
    let bytes = reader.read_line(&mut line).map_err(|err| err.to_string())?;
    if bytes == 0 {
        return Err("connection closed unexpectedly".to_string());
    }
    serde_json::from_str(&line).map_err(|err| err.to_string())
}

fn wait_for_return(reader: &mut impl BufRead) -> std::result::Result<Value, String> {
    loop {
        let message = read_message(reader)?;
        if let Some(value) = message.get("return") {
            return Ok(value.clone());
        }
        if let Some(err) = message.get("error") {
            let class = err.get("class").and_then(Value::as_str).unwrap_or("Error");
            let desc = err.get("desc").and_then(Value::as_str).unwrap_or_default();
            return Err(format!("{class}: {desc}"));
        }
        // Asynchronous event.
    }
}

/// Runs one guest-agent command on a fresh connection. The guest agent has no greeting; a
/// `guest-sync` with a random id flushes stale replies left in the channel.
pub fn guest_agent_execute(
    vm: &str,
    socket: &Path,
    command: &str,
    timeout: Duration,
) -> Result<Value> {
    let failure = |message: String| Error::ControlProtocol {
        vm: vm.to_string(),
        message: format!("guest agent `{command}`: {message}"),
    };

    let stream = UnixStream::connect(socket).map_err(|err| failure(err.to_string()))?;
    stream
        .set_read_timeout(Some(timeout))
        .and_then(|()| stream.set_write_timeout(Some(timeout)))
        .map_err(|err| failure(err.to_string()))?;
    let mut writer = stream.try_clone().map_err(|err| failure(err.to_string()))?;
    let mut reader = BufReader::new(stream);

    let id: u32 = rand::random();
    send(
        &mut writer,
        &json!({ "execute": "guest-sync", "arguments": { "id": id } }),
    )
    .map_err(failure)?;
    loop {
        let reply = wait_for_return(&mut reader).map_err(failure)?;
        if reply.as_u64() == Some(u64::from(id)) {
            break;
        }
    }

    send(&mut writer, &json!({ "execute": command })).map_err(failure)?;
    wait_for_return(&mut reader).map_err(failure)
}
