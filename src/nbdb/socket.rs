use log::debug;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::Mutex;

use super::Error;

/// JSON-RPC connection to the OVSDB server over TCP or a Unix socket.
/// Requests are serialized; the server's `echo` keepalives are answered
/// inline while waiting for a reply.
pub(super) struct Socket {
    conn: Mutex<Conn>,
    next_id: AtomicU64,
}

struct Conn {
    stream: Stream,
    buf: Vec<u8>,
}

enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Socket {
    pub(super) async fn connect(addr: &str) -> Result<Self, Error> {
        let stream = if let Some(addr) = addr.strip_prefix("tcp:") {
            Stream::Tcp(TcpStream::connect(addr).await?)
        } else if let Some(path) = addr.strip_prefix("unix:") {
            Stream::Unix(UnixStream::connect(path).await?)
        } else {
            return Err(Error::Address(addr.to_string()));
        };
        Ok(Socket {
            conn: Mutex::new(Conn {
                stream,
                buf: Vec::new(),
            }),
            next_id: AtomicU64::new(0),
        })
    }

    pub(super) async fn transact(&self, db: &str, ops: &[Value]) -> Result<Vec<Value>, Error> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut params = vec![json!(db)];
        params.extend(ops.iter().cloned());
        let request = json!({"method": "transact", "params": params, "id": id});

        let mut conn = self.conn.lock().await;
        conn.send(&request).await?;

        loop {
            let message = conn.read_message().await?;

            // The server checks liveness with echo requests; answer them or
            // it drops the connection.
            if message.get("method").and_then(Value::as_str) == Some("echo") {
                let reply = json!({
                    "id": message.get("id").cloned().unwrap_or(Value::Null),
                    "result": message.get("params").cloned().unwrap_or(json!([])),
                    "error": Value::Null,
                });
                conn.send(&reply).await?;
                continue;
            }

            if message.get("id").and_then(Value::as_u64) != Some(id) {
                debug!("ignoring unsolicited message: {message}");
                continue;
            }

            match message.get("error") {
                None | Some(Value::Null) => {}
                Some(error) => return Err(Error::Rpc(error.to_string())),
            }
            let Some(Value::Array(results)) = message.get("result").cloned() else {
                return Err(Error::Rpc(format!("malformed reply: {message}")));
            };
            return Ok(results);
        }
    }
}

impl Conn {
    async fn send(&mut self, message: &Value) -> Result<(), Error> {
        let bytes = serde_json::to_vec(message)?;
        match &mut self.stream {
            Stream::Tcp(s) => s.write_all(&bytes).await?,
            Stream::Unix(s) => s.write_all(&bytes).await?,
        }
        Ok(())
    }

    /// Reads one JSON value; the wire is a plain concatenation of values, so
    /// bytes are accumulated until one parses completely.
    async fn read_message(&mut self) -> Result<Value, Error> {
        loop {
            if !self.buf.is_empty() {
                let mut values = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Value>();
                match values.next() {
                    Some(Ok(value)) => {
                        let consumed = values.byte_offset();
                        self.buf.drain(..consumed);
                        return Ok(value);
                    }
                    Some(Err(e)) if e.is_eof() => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => {}
                }
            }

            let mut chunk = [0u8; 4096];
            let n = match &mut self.stream {
                Stream::Tcp(s) => s.read(&mut chunk).await?,
                Stream::Unix(s) => s.read(&mut chunk).await?,
            };
            if n == 0 {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "database connection closed",
                )));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}
