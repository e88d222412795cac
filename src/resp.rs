//! RESP2 client framing.
//!
//! The backend speaks the Redis serialization protocol over a duplex TCP
//! stream. `Connection` buffers outgoing command frames so a whole batch is
//! written with one flush, and parses replies incrementally out of a single
//! read buffer. Dial, read and write each obey the configured per-operation
//! timeout; a timeout or protocol error poisons the connection, which is then
//! closed instead of being reused.

use std::fmt;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Error, Result};
use crate::value::Key;

/// A single backend command: name plus binary-safe arguments.
#[derive(Debug, Clone)]
pub struct Command {
    name: &'static str,
    args: Vec<Bytes>,
}

impl Command {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<Arg>) -> Self {
        self.args.push(arg.into().0);
        self
    }

    pub fn add(&mut self, arg: impl Into<Arg>) -> &mut Self {
        self.args.push(arg.into().0);
        self
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        // one array frame: name followed by each argument as a bulk string
        buf.put_u8(b'*');
        buf.put_slice((1 + self.args.len()).to_string().as_bytes());
        buf.put_slice(b"\r\n");
        put_bulk(buf, self.name.as_bytes());
        for arg in &self.args {
            put_bulk(buf, arg);
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} args)", self.name, self.args.len())
    }
}

/// A binary-safe command argument.
pub struct Arg(Bytes);

impl From<Bytes> for Arg {
    fn from(b: Bytes) -> Self {
        Arg(b)
    }
}

impl From<Vec<u8>> for Arg {
    fn from(b: Vec<u8>) -> Self {
        Arg(Bytes::from(b))
    }
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Arg(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Arg(Bytes::from(s.into_bytes()))
    }
}

impl From<&Key> for Arg {
    fn from(k: &Key) -> Self {
        Arg(Bytes::copy_from_slice(k.as_bytes()))
    }
}

impl From<i64> for Arg {
    fn from(i: i64) -> Self {
        Arg(Bytes::from(i.to_string().into_bytes()))
    }
}

impl From<u64> for Arg {
    fn from(u: u64) -> Self {
        Arg(Bytes::from(u.to_string().into_bytes()))
    }
}

impl From<usize> for Arg {
    fn from(u: usize) -> Self {
        Arg(Bytes::from(u.to_string().into_bytes()))
    }
}

fn put_bulk(buf: &mut BytesMut, payload: &[u8]) {
    buf.put_u8(b'$');
    buf.put_slice(payload.len().to_string().as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(payload);
    buf.put_slice(b"\r\n");
}

/// A parsed backend reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Int(i64),
    Bulk(Bytes),
    Nil,
    Array(Vec<Reply>),
}

impl Reply {
    /// Turns an error reply into an `Err`, passing everything else through.
    pub fn ok(self) -> Result<Reply> {
        match self {
            Reply::Error(msg) => Err(Error::backend(msg)),
            other => Ok(other),
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Nil)
    }

    pub fn as_int(&self) -> Result<i64> {
        match self {
            Reply::Int(i) => Ok(*i),
            Reply::Bulk(b) => std::str::from_utf8(b)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| Error::backend("expected integer reply")),
            other => Err(Error::backend(format!(
                "expected integer reply, got {other:?}"
            ))),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        Ok(self.as_int()? != 0)
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Reply::Bulk(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Reply::Simple(s) => Some(s),
            Reply::Bulk(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    pub fn into_array(self) -> Result<Vec<Reply>> {
        match self {
            Reply::Array(items) => Ok(items),
            Reply::Nil => Ok(Vec::new()),
            other => Err(Error::backend(format!(
                "expected array reply, got {other:?}"
            ))),
        }
    }

    /// Flattens an array reply into strings, skipping nils.
    pub fn into_strings(self) -> Result<Vec<String>> {
        let items = self.into_array()?;
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Reply::Bulk(b) => out.push(String::from_utf8_lossy(&b).into_owned()),
                Reply::Simple(s) => out.push(s),
                Reply::Nil => {}
                other => {
                    return Err(Error::backend(format!(
                        "expected string element, got {other:?}"
                    )))
                }
            }
        }
        Ok(out)
    }

    /// Array elements as optional byte strings (nil-preserving).
    pub fn into_byte_options(self) -> Result<Vec<Option<Bytes>>> {
        let items = self.into_array()?;
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Reply::Bulk(b) => out.push(Some(b)),
                Reply::Nil => out.push(None),
                other => {
                    return Err(Error::backend(format!(
                        "expected bulk element, got {other:?}"
                    )))
                }
            }
        }
        Ok(out)
    }
}

/// One duplex connection to the backend.
pub struct Connection {
    stream: TcpStream,
    rbuf: BytesMut,
    wbuf: BytesMut,
    timeout: Duration,
}

impl Connection {
    pub async fn connect(addr: &str, timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::backend(format!("dial timeout connecting to {addr}")))?
            .map_err(|e| Error::backend(format!("could not connect to {addr}: {e}")))?;
        stream.set_nodelay(true).ok();
        Ok(Self {
            stream,
            rbuf: BytesMut::with_capacity(4096),
            wbuf: BytesMut::with_capacity(4096),
            timeout,
        })
    }

    /// Appends a command frame to the write buffer without touching the wire.
    pub fn enqueue(&mut self, cmd: &Command) {
        cmd.encode_into(&mut self.wbuf);
    }

    pub async fn flush(&mut self) -> Result<()> {
        if self.wbuf.is_empty() {
            return Ok(());
        }
        let frame = self.wbuf.split();
        tokio::time::timeout(self.timeout, self.stream.write_all(&frame))
            .await
            .map_err(|_| Error::backend("write timeout"))??;
        Ok(())
    }

    /// Reads a single reply, pulling more bytes from the socket as needed.
    pub async fn receive(&mut self) -> Result<Reply> {
        loop {
            if let Some((reply, consumed)) = parse_reply(&self.rbuf)? {
                self.rbuf.advance(consumed);
                return Ok(reply);
            }
            let n = tokio::time::timeout(self.timeout, self.stream.read_buf(&mut self.rbuf))
                .await
                .map_err(|_| Error::backend("read timeout"))??;
            if n == 0 {
                return Err(Error::backend("connection closed by backend"));
            }
        }
    }

    /// Send one command and wait for its reply. Error replies become `Err`.
    pub async fn call(&mut self, cmd: &Command) -> Result<Reply> {
        self.enqueue(cmd);
        self.flush().await?;
        self.receive().await?.ok()
    }
}

/// Attempts to parse one complete reply from the front of `buf`.
/// Returns `None` when more bytes are needed.
fn parse_reply(buf: &[u8]) -> Result<Option<(Reply, usize)>> {
    let Some((line, line_len)) = read_line(buf) else {
        return Ok(None);
    };
    let Some((&kind, rest)) = line.split_first() else {
        return Err(Error::backend("empty reply line"));
    };

    match kind {
        b'+' => Ok(Some((
            Reply::Simple(String::from_utf8_lossy(rest).into_owned()),
            line_len,
        ))),
        b'-' => Ok(Some((
            Reply::Error(String::from_utf8_lossy(rest).into_owned()),
            line_len,
        ))),
        b':' => {
            let i = parse_int(rest)?;
            Ok(Some((Reply::Int(i), line_len)))
        }
        b'$' => {
            let len = parse_int(rest)?;
            if len < 0 {
                return Ok(Some((Reply::Nil, line_len)));
            }
            let len = len as usize;
            let needed = line_len + len + 2;
            if buf.len() < needed {
                return Ok(None);
            }
            let payload = Bytes::copy_from_slice(&buf[line_len..line_len + len]);
            Ok(Some((Reply::Bulk(payload), needed)))
        }
        b'*' => {
            let count = parse_int(rest)?;
            if count < 0 {
                return Ok(Some((Reply::Nil, line_len)));
            }
            let mut items = Vec::with_capacity(count as usize);
            let mut offset = line_len;
            for _ in 0..count {
                match parse_reply(&buf[offset..])? {
                    Some((item, used)) => {
                        items.push(item);
                        offset += used;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((Reply::Array(items), offset)))
        }
        other => Err(Error::backend(format!(
            "unexpected reply marker: {}",
            other as char
        ))),
    }
}

/// Returns the line content (without CRLF) and the byte length including CRLF.
fn read_line(buf: &[u8]) -> Option<(&[u8], usize)> {
    let pos = buf.windows(2).position(|w| w == b"\r\n")?;
    Some((&buf[..pos], pos + 2))
}

fn parse_int(digits: &[u8]) -> Result<i64> {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::backend("malformed integer in reply"))
}
