//! Assuan line protocol used to talk to gpg-agent.
//!
//! Responses are parsed line by line into [`AgentEvent`]s and consumed
//! by [`transact`], which collects data and status lines until the
//! terminating `OK` or `ERR`. A response that ends early is an error; the
//! data gathered so far is never handed out.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Maximum length of a protocol line, excluding the terminating LF.
pub const MAX_LINE_LEN: usize = 1000;

/// Bytes of payload per outgoing `D` line, leaving room for escapes.
const DATA_CHUNK: usize = 300;

/// Errors raised while exchanging messages with the agent.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed response line: {0}")]
    Malformed(String),
    #[error("response truncated: connection closed before OK/ERR")]
    Truncated,
    #[error("agent error {code}: {message}")]
    Agent { code: u32, message: String },
    #[error("transport error: {0}")]
    Io(String),
}

impl From<io::Error> for ProtocolError {
    fn from(e: io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl ProtocolError {
    /// True when the session can no longer be trusted to be in sync.
    pub fn breaks_session(&self) -> bool {
        !matches!(self, Self::Agent { .. })
    }
}

/// One parsed response line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    Ok(String),
    Error { code: u32, message: String },
    Status { tag: String, args: String },
    Data(Vec<u8>),
    Inquire { keyword: String, args: String },
    Comment(String),
}

/// Bidirectional line transport to the agent.
pub trait AgentTransport: Send {
    /// Sends one line; the LF terminator is appended by the transport.
    fn send_line(&mut self, line: &[u8]) -> io::Result<()>;

    /// Reads one line without its terminator. `None` signals end of stream.
    fn read_line(&mut self) -> io::Result<Option<Vec<u8>>>;
}

/// Transport over the agent's Unix domain socket.
pub struct UnixSocketTransport {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
}

impl UnixSocketTransport {
    /// Connects to the socket at `path`.
    pub fn connect(path: &Path, io_timeout: Option<Duration>) -> io::Result<Self> {
        let stream = UnixStream::connect(path)?;
        stream.set_read_timeout(io_timeout)?;
        stream.set_write_timeout(io_timeout)?;
        let writer = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(stream),
            writer,
        })
    }
}

impl AgentTransport for UnixSocketTransport {
    fn send_line(&mut self, line: &[u8]) -> io::Result<()> {
        if line.len() > MAX_LINE_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "request line too long",
            ));
        }
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line);
        buf.push(b'\n');
        self.writer.write_all(&buf)?;
        self.writer.flush()
    }

    fn read_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        let mut line = Vec::new();
        let limit = (MAX_LINE_LEN + 2) as u64;
        let n = (&mut self.reader).take(limit).read_until(b'\n', &mut line)?;
        if n == 0 {
            return Ok(None);
        }
        if line.last() != Some(&b'\n') {
            if line.len() as u64 >= limit {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "response line exceeds protocol limit",
                ));
            }
            // Stream ended in the middle of a line.
            return Ok(None);
        }
        line.pop();
        Ok(Some(line))
    }
}

/// Decodes `%XX` escapes in a data line payload.
pub fn percent_decode(input: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        if input[i] == b'%' {
            let hex = input
                .get(i + 1..i + 3)
                .ok_or_else(|| ProtocolError::Malformed("truncated percent escape".into()))?;
            let hi = hex_value(hex[0]);
            let lo = hex_value(hex[1]);
            match (hi, lo) {
                (Some(hi), Some(lo)) => out.push(hi << 4 | lo),
                _ => {
                    return Err(ProtocolError::Malformed(format!(
                        "invalid percent escape %{}",
                        String::from_utf8_lossy(hex)
                    )))
                }
            }
            i += 3;
        } else {
            out.push(input[i]);
            i += 1;
        }
    }
    Ok(out)
}

/// Escapes bytes that may not appear raw in a data line.
pub fn percent_encode(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    for &b in input {
        if b == b'%' || b == b'\r' || b == b'\n' || b < 0x20 {
            out.extend_from_slice(format!("%{:02X}", b).as_bytes());
        } else {
            out.push(b);
        }
    }
    out
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

fn split_word(rest: &[u8]) -> (String, String) {
    let text = String::from_utf8_lossy(rest);
    match text.split_once(' ') {
        Some((word, args)) => (word.to_string(), args.to_string()),
        None => (text.into_owned(), String::new()),
    }
}

/// Parses one response line.
pub fn parse_line(line: &[u8]) -> Result<AgentEvent, ProtocolError> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let lossy = || String::from_utf8_lossy(line).into_owned();

    if line == b"OK" {
        return Ok(AgentEvent::Ok(String::new()));
    }
    if let Some(rest) = line.strip_prefix(b"OK ") {
        return Ok(AgentEvent::Ok(String::from_utf8_lossy(rest).into_owned()));
    }
    if let Some(rest) = line.strip_prefix(b"ERR ") {
        let (code, message) = split_word(rest);
        let code = code
            .parse::<u32>()
            .map_err(|_| ProtocolError::Malformed(lossy()))?;
        return Ok(AgentEvent::Error { code, message });
    }
    if let Some(rest) = line.strip_prefix(b"S ") {
        let (tag, args) = split_word(rest);
        if tag.is_empty() {
            return Err(ProtocolError::Malformed(lossy()));
        }
        return Ok(AgentEvent::Status { tag, args });
    }
    if let Some(rest) = line.strip_prefix(b"D ") {
        return Ok(AgentEvent::Data(percent_decode(rest)?));
    }
    if let Some(rest) = line.strip_prefix(b"INQUIRE ") {
        let (keyword, args) = split_word(rest);
        return Ok(AgentEvent::Inquire { keyword, args });
    }
    if let Some(rest) = line.strip_prefix(b"#") {
        return Ok(AgentEvent::Comment(
            String::from_utf8_lossy(rest).trim_start().to_string(),
        ));
    }
    Err(ProtocolError::Malformed(lossy()))
}

/// Collected result of a successful transaction.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub data: Vec<u8>,
    pub status: Vec<(String, String)>,
}

/// Reads the server greeting that follows a fresh connection.
pub fn expect_greeting(transport: &mut dyn AgentTransport) -> Result<(), ProtocolError> {
    match transport.read_line()? {
        None => Err(ProtocolError::Truncated),
        Some(line) => match parse_line(&line)? {
            AgentEvent::Ok(_) => Ok(()),
            AgentEvent::Error { code, message } => Err(ProtocolError::Agent { code, message }),
            other => Err(ProtocolError::Malformed(format!(
                "unexpected greeting {:?}",
                other
            ))),
        },
    }
}

/// Sends `command` and consumes the response up to `OK` or `ERR`.
///
/// `on_inquire` answers server inquiries; returning `None` cancels the
/// inquiry.
pub fn transact(
    transport: &mut dyn AgentTransport,
    command: &str,
    on_inquire: &mut dyn FnMut(&str, &str) -> Option<Vec<u8>>,
) -> Result<Transaction, ProtocolError> {
    transport.send_line(command.as_bytes())?;

    let mut result = Transaction::default();
    loop {
        let line = transport.read_line()?.ok_or(ProtocolError::Truncated)?;
        match parse_line(&line)? {
            AgentEvent::Ok(_) => return Ok(result),
            AgentEvent::Error { code, message } => {
                return Err(ProtocolError::Agent { code, message })
            }
            AgentEvent::Data(bytes) => result.data.extend_from_slice(&bytes),
            AgentEvent::Status { tag, args } => result.status.push((tag, args)),
            AgentEvent::Comment(_) => {}
            AgentEvent::Inquire { keyword, args } => match on_inquire(&keyword, &args) {
                Some(reply) => {
                    for chunk in reply.chunks(DATA_CHUNK) {
                        let mut line = b"D ".to_vec();
                        line.extend_from_slice(&percent_encode(chunk));
                        transport.send_line(&line)?;
                    }
                    transport.send_line(b"END")?;
                }
                None => transport.send_line(b"CAN")?,
            },
        }
    }
}

/// Inquiry handler that cancels every inquiry.
pub fn no_inquire(_keyword: &str, _args: &str) -> Option<Vec<u8>> {
    None
}
