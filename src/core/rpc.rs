//! Newline-delimited JSON RPC between migration peers, one request per TCP connection.

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::process::LaunchConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub cookie: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Failure>,
}

impl Response {
    pub fn ok(result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(err: &Error) -> Self {
        Self {
            result: None,
            error: Some(Failure {
                kind: error_kind(err).to_string(),
                message: err.to_string(),
            }),
        }
    }
}

fn error_kind(err: &Error) -> &'static str {
    match err {
        Error::Authentication { .. } => "authentication",
        Error::ConfigChanged { .. } => "config_changed",
        Error::LockBusy { .. } => "lock_busy",
        Error::Migration { .. } => "migration",
        Error::InvalidCommand { .. } => "invalid_command",
        _ => "internal",
    }
}

pub fn read_message<T: for<'de> Deserialize<'de>>(stream: &TcpStream) -> std::io::Result<T> {
    let mut line = String::new();
    BufReader::new(stream).read_line(&mut line)?;
    if line.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "peer closed the connection",
        ));
    }
    serde_json::from_str(&line)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
}

pub fn write_message<T: Serialize>(mut stream: &TcpStream, message: &T) -> std::io::Result<()> {
    let mut data = serde_json::to_vec(message)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    data.push(b'\n');
    stream.write_all(&data)?;
    stream.flush()
}

/// Client side of the incoming-migration RPC surface. Cheap to clone so a heartbeat thread can
/// hold its own copy.
#[derive(Debug, Clone)]
pub struct RpcClient {
    peer: String,
    cookie: String,
    timeout: Duration,
}

impl RpcClient {
    pub fn new(peer: impl Into<String>, cookie: impl Into<String>, timeout: Duration) -> Self {
        Self {
            peer: peer.into(),
            cookie: cookie.into(),
            timeout,
        }
    }

    fn failure(&self, method: &str, message: impl Into<String>) -> Error {
        Error::Rpc {
            peer: self.peer.clone(),
            method: method.to_string(),
            message: message.into(),
        }
    }

    fn resolve(&self, method: &str) -> Result<SocketAddr> {
        self.peer
            .to_socket_addrs()
            .map_err(|err| self.failure(method, format!("cannot resolve: {err}")))?
            .next()
            .ok_or_else(|| self.failure(method, "address resolved to nothing"))
    }

    pub fn call(&self, method: &str, params: Value) -> Result<Value> {
        let address = self.resolve(method)?;
        let stream = TcpStream::connect_timeout(&address, self.timeout)
            .map_err(|err| self.failure(method, err.to_string()))?;
        stream
            .set_read_timeout(Some(self.timeout))
            .and_then(|()| stream.set_write_timeout(Some(self.timeout)))
            .map_err(|err| self.failure(method, err.to_string()))?;

        let request = Request {
            cookie: self.cookie.clone(),
            method: method.to_string(),
            params,
        };
        write_message(&stream, &request).map_err(|err| self.failure(method, err.to_string()))?;
        let response: Response =
            read_message(&stream).map_err(|err| self.failure(method, err.to_string()))?;

        match (response.result, response.error) {
            (_, Some(failure)) => Err(match failure.kind.as_str() {
                "authentication" => Error::Authentication {
                    method: method.to_string(),
                },
                _ => self.failure(method, format!("{}: {}", failure.kind, failure.message)),
            }),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(Value::Null),
        }
    }

    /// Keeps the session alive for at least `extend`, or the server's default extension.
    pub fn ping(&self, extend: Option<Duration>) -> Result<()> {
        let params = match extend {
            Some(extend) => json!({ "timeout": extend.as_secs_f64() }),
            None => json!({}),
        };
        self.call("ping", params).map(drop)
    }

    pub fn acquire_migration_lock(&self) -> Result<bool> {
        Ok(self
            .call("acquire_migration_lock", Value::Null)?
            .as_bool()
            .unwrap_or(false))
    }

    pub fn acquire_ceph_locks(&self) -> Result<()> {
        self.call("acquire_ceph_locks", Value::Null).map(drop)
    }

    /// Returns the migration URI the destination listens on.
    pub fn prepare_incoming(&self, launch: &LaunchConfig) -> Result<String> {
        let result = self.call("prepare_incoming", json!({ "launch": launch }))?;
        result
            .get("uri")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| self.failure("prepare_incoming", "response carries no uri"))
    }

    pub fn finish_incoming(&self) -> Result<()> {
        self.call("finish_incoming", Value::Null).map(drop)
    }

    pub fn rescue(&self) -> Result<()> {
        self.call("rescue", Value::Null).map(drop)
    }

    pub fn cancel(&self) -> Result<()> {
        self.call("cancel", Value::Null).map(drop)
    }

    pub fn destroy(&self) -> Result<()> {
        self.call("destroy", Value::Null).map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn serve_once(reply: Response) -> (String, thread::JoinHandle<Request>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let request: Request = read_message(&stream).unwrap();
            write_message(&stream, &reply).unwrap();
            request
        });
        (address, handle)
    }

    #[test]
    fn call_sends_cookie_and_method() {
        let (address, server) = serve_once(Response::ok(json!("pong")));
        let client = RpcClient::new(address, "c00kie", Duration::from_secs(2));
        client.ping(Some(Duration::from_secs(30))).unwrap();

        let request = server.join().unwrap();
        assert_eq!(request.cookie, "c00kie");
        assert_eq!(request.method, "ping");
        assert_eq!(request.params["timeout"], 30.0);
    }

    #[test]
    fn authentication_failures_map_to_typed_error() {
        let err = Error::Authentication {
            method: "cancel".to_string(),
        };
        let (address, server) = serve_once(Response::failed(&err));
        let client = RpcClient::new(address, "wrong", Duration::from_secs(2));
        assert!(matches!(
            client.cancel(),
            Err(Error::Authentication { method }) if method == "cancel"
        ));
        server.join().unwrap();
    }

    #[test]
    fn remote_failures_carry_kind_and_message() {
        let err = Error::migration("test", "process is not running");
        let (address, server) = serve_once(Response::failed(&err));
        let client = RpcClient::new(address, "c00kie", Duration::from_secs(2));
        match client.finish_incoming() {
            Err(Error::Rpc { method, message, .. }) => {
                assert_eq!(method, "finish_incoming");
                assert!(message.starts_with("migration:"));
                assert!(message.contains("process is not running"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        server.join().unwrap();
    }

    #[test]
    fn unreachable_peer_is_an_rpc_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        let client = RpcClient::new(address, "c00kie", Duration::from_millis(200));
        assert!(matches!(client.ping(None), Err(Error::Rpc { .. })));
    }
}
