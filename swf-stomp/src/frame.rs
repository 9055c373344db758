//! STOMP frame model and codec
//!
//! Frames are `COMMAND\n` followed by `name:value` header lines, a blank line,
//! the body and a terminating NUL. A bare EOL between frames is a heart-beat.
//! Header values are escaped (`\\`, `\n`, `\c`, `\r`) on every frame except
//! CONNECT and CONNECTED.

use crate::destination::AckMode;
use crate::error::{BusError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::str::FromStr;

/// Largest header block accepted before the blank line is seen
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Largest frame body accepted from the broker
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Well-known header names
pub mod headers {
    pub const ACCEPT_VERSION: &str = "accept-version";
    pub const ACK: &str = "ack";
    pub const CLIENT_ID: &str = "client-id";
    pub const CONTENT_LENGTH: &str = "content-length";
    pub const CONTENT_TYPE: &str = "content-type";
    pub const DESTINATION: &str = "destination";
    pub const HEART_BEAT: &str = "heart-beat";
    pub const HOST: &str = "host";
    pub const ID: &str = "id";
    pub const LOGIN: &str = "login";
    pub const MESSAGE: &str = "message";
    pub const MESSAGE_ID: &str = "message-id";
    pub const PASSCODE: &str = "passcode";
    pub const PREFETCH_SIZE: &str = "activemq.prefetchSize";
    pub const RECEIPT: &str = "receipt";
    pub const RECEIPT_ID: &str = "receipt-id";
    pub const SELECTOR: &str = "selector";
    pub const SERVER: &str = "server";
    pub const SESSION: &str = "session";
    pub const SUBSCRIPTION: &str = "subscription";
    pub const VERSION: &str = "version";
}

/// STOMP command verbs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    /// Command verb as written on the wire
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Stomp => "STOMP",
            Self::Connected => "CONNECTED",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::Begin => "BEGIN",
            Self::Commit => "COMMIT",
            Self::Abort => "ABORT",
            Self::Disconnect => "DISCONNECT",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
        }
    }

    /// CONNECT and CONNECTED frames carry raw header values
    const fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "CONNECT" => Self::Connect,
            "STOMP" => Self::Stomp,
            "CONNECTED" => Self::Connected,
            "SEND" => Self::Send,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "ACK" => Self::Ack,
            "NACK" => Self::Nack,
            "BEGIN" => Self::Begin,
            "COMMIT" => Self::Commit,
            "ABORT" => Self::Abort,
            "DISCONNECT" => Self::Disconnect,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            other => return Err(BusError::protocol(format!("Unknown command '{other}'"))),
        })
    }
}

/// A single STOMP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Command verb
    pub command: Command,
    /// Headers in wire order; repeated names keep the first occurrence authoritative
    pub headers: Vec<(String, String)>,
    /// Raw body bytes
    pub body: Bytes,
}

impl Frame {
    /// Create an empty frame for `command`
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Append a header (builder style)
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Replace the body (builder style)
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// First value of header `name`
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Body decoded as UTF-8, replacing invalid sequences
    pub fn body_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// CONNECT frame for STOMP 1.1/1.2
    pub fn connect(
        vhost: &str,
        login: &str,
        passcode: &str,
        client_id: &str,
        heart_beat: HeartBeat,
    ) -> Self {
        Self::new(Command::Connect)
            .with_header(headers::ACCEPT_VERSION, "1.1,1.2")
            .with_header(headers::HOST, vhost)
            .with_header(headers::LOGIN, login)
            .with_header(headers::PASSCODE, passcode)
            .with_header(headers::CLIENT_ID, client_id)
            .with_header(headers::HEART_BEAT, heart_beat.to_string())
    }

    /// SUBSCRIBE frame carrying id, ack mode, prefetch and optional selector
    pub fn subscribe(
        id: u64,
        destination: &str,
        ack: AckMode,
        prefetch: u32,
        selector: Option<&str>,
    ) -> Self {
        let mut frame = Self::new(Command::Subscribe)
            .with_header(headers::ID, id.to_string())
            .with_header(headers::DESTINATION, destination)
            .with_header(headers::ACK, ack.as_str())
            .with_header(headers::PREFETCH_SIZE, prefetch.to_string());
        if let Some(selector) = selector {
            frame = frame.with_header(headers::SELECTOR, selector);
        }
        frame
    }

    /// UNSUBSCRIBE frame for a subscription id
    pub fn unsubscribe(id: u64) -> Self {
        Self::new(Command::Unsubscribe).with_header(headers::ID, id.to_string())
    }

    /// SEND frame; extra headers are appended after `destination`
    pub fn send(destination: &str, body: impl Into<Bytes>, extra: &[(String, String)]) -> Self {
        let mut frame = Self::new(Command::Send).with_header(headers::DESTINATION, destination);
        frame.headers.extend(extra.iter().cloned());
        frame.with_body(body)
    }

    /// ACK frame; carries both the 1.2 `id` and the 1.1 `message-id`/`subscription` headers
    pub fn ack(ack_id: &str, subscription: u64) -> Self {
        Self::acknowledgment(Command::Ack, ack_id, subscription)
    }

    /// NACK frame, same header set as [`Frame::ack`]
    pub fn nack(ack_id: &str, subscription: u64) -> Self {
        Self::acknowledgment(Command::Nack, ack_id, subscription)
    }

    fn acknowledgment(command: Command, ack_id: &str, subscription: u64) -> Self {
        Self::new(command)
            .with_header(headers::ID, ack_id)
            .with_header(headers::MESSAGE_ID, ack_id)
            .with_header(headers::SUBSCRIPTION, subscription.to_string())
    }

    /// DISCONNECT frame requesting a receipt
    pub fn disconnect(receipt: &str) -> Self {
        Self::new(Command::Disconnect).with_header(headers::RECEIPT, receipt)
    }

    /// Serialize this frame onto `dst`
    pub fn encode(&self, dst: &mut BytesMut) {
        let escape = self.command.escapes_headers();
        dst.reserve(self.encoded_len_hint());
        dst.put_slice(self.command.as_str().as_bytes());
        dst.put_u8(b'\n');
        for (name, value) in &self.headers {
            if escape {
                put_escaped(dst, name);
                dst.put_u8(b':');
                put_escaped(dst, value);
            } else {
                dst.put_slice(name.as_bytes());
                dst.put_u8(b':');
                dst.put_slice(value.as_bytes());
            }
            dst.put_u8(b'\n');
        }
        dst.put_u8(b'\n');
        dst.put_slice(&self.body);
        dst.put_u8(0);
    }

    /// Serialize this frame into a fresh buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    fn encoded_len_hint(&self) -> usize {
        let header_len: usize = self
            .headers
            .iter()
            .map(|(k, v)| k.len().saturating_add(v.len()).saturating_add(2))
            .sum();
        self.command
            .as_str()
            .len()
            .saturating_add(header_len)
            .saturating_add(self.body.len())
            .saturating_add(3)
    }
}

/// Output of one decode step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A bare EOL sent to keep the connection alive
    HeartBeat,
    /// A complete frame
    Frame(Frame),
}

/// Decode one heart-beat or frame from the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed; consumed bytes are removed
/// from `buf` only when a complete item is returned.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Decoded>> {
    match buf.first() {
        None => return Ok(None),
        Some(b'\n') => {
            buf.advance(1);
            return Ok(Some(Decoded::HeartBeat));
        }
        Some(b'\r') => {
            return match buf.get(1) {
                None => Ok(None),
                Some(b'\n') => {
                    buf.advance(2);
                    Ok(Some(Decoded::HeartBeat))
                }
                Some(_) => Err(BusError::protocol("Stray carriage return between frames")),
            };
        }
        Some(_) => {}
    }

    let Some((head_end, body_start)) = find_header_end(buf) else {
        if buf.len() > MAX_HEADER_BYTES {
            return Err(BusError::protocol(format!(
                "Header block exceeds {MAX_HEADER_BYTES} bytes"
            )));
        }
        return Ok(None);
    };

    let head = std::str::from_utf8(&buf[..head_end])
        .map_err(|e| BusError::protocol(format!("Header block is not UTF-8: {e}")))?;
    let mut lines = head.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));
    let command: Command = lines.next().unwrap_or_default().parse()?;
    let escape = command.escapes_headers();

    let mut parsed = Vec::new();
    for line in lines.filter(|l| !l.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| BusError::protocol(format!("Malformed header line '{line}'")))?;
        if escape {
            parsed.push((unescape(name)?, unescape(value)?));
        } else {
            parsed.push((name.to_owned(), value.to_owned()));
        }
    }

    let content_length = parsed
        .iter()
        .find(|(k, _)| k == headers::CONTENT_LENGTH)
        .map(|(_, v)| {
            v.trim()
                .parse::<usize>()
                .map_err(|e| BusError::protocol(format!("Invalid content-length '{v}': {e}")))
        })
        .transpose()?;

    let body_end = match content_length {
        Some(len) => {
            if len > MAX_BODY_BYTES {
                return Err(BusError::protocol(format!(
                    "Frame body of {len} bytes exceeds {MAX_BODY_BYTES}"
                )));
            }
            let end = body_start.saturating_add(len);
            match buf.get(end) {
                None => return Ok(None),
                Some(0) => end,
                Some(_) => {
                    return Err(BusError::protocol(
                        "Frame body not terminated by NUL after content-length bytes",
                    ));
                }
            }
        }
        None => match buf[body_start..].iter().position(|&b| b == 0) {
            Some(offset) => body_start.saturating_add(offset),
            None => {
                if buf.len().saturating_sub(body_start) > MAX_BODY_BYTES {
                    return Err(BusError::protocol(format!(
                        "Frame body exceeds {MAX_BODY_BYTES} bytes"
                    )));
                }
                return Ok(None);
            }
        },
    };

    let mut raw = buf.split_to(body_end.saturating_add(1));
    raw.truncate(body_end);
    let body = raw.split_off(body_start).freeze();

    Ok(Some(Decoded::Frame(Frame {
        command,
        headers: parsed,
        body,
    })))
}

/// Locate the blank line ending the header block.
///
/// Returns the end of the header text and the index where the body starts.
fn find_header_end(buf: &[u8]) -> Option<(usize, usize)> {
    let mut line_start = 0;
    for (i, &b) in buf.iter().enumerate() {
        if b != b'\n' {
            continue;
        }
        let line = &buf[line_start..i];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() && line_start > 0 {
            return Some((line_start.saturating_sub(1), i.saturating_add(1)));
        }
        line_start = i.saturating_add(1);
    }
    None
}

fn put_escaped(dst: &mut BytesMut, value: &str) {
    for ch in value.chars() {
        match ch {
            '\\' => dst.put_slice(b"\\\\"),
            '\n' => dst.put_slice(b"\\n"),
            '\r' => dst.put_slice(b"\\r"),
            ':' => dst.put_slice(b"\\c"),
            other => {
                let mut tmp = [0_u8; 4];
                dst.put_slice(other.encode_utf8(&mut tmp).as_bytes());
            }
        }
    }
}

fn unescape(value: &str) -> Result<String> {
    if !value.contains('\\') {
        return Ok(value.to_owned());
    }
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(BusError::protocol(format!(
                    "Undefined escape sequence '\\{}'",
                    other.map(String::from).unwrap_or_default()
                )));
            }
        }
    }
    Ok(out)
}

/// Negotiated or requested heart-beat intervals in milliseconds.
///
/// `send` is how often this side promises to send, `receive` how often it
/// wants to hear from the peer. Zero disables that direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartBeat {
    pub send_ms: u64,
    pub receive_ms: u64,
}

impl HeartBeat {
    pub const fn new(send_ms: u64, receive_ms: u64) -> Self {
        Self {
            send_ms,
            receive_ms,
        }
    }

    /// Combine the client request with the server's CONNECTED header.
    ///
    /// Each direction uses the larger of the two values, or zero if either
    /// side disables it.
    pub fn negotiate(self, server: Self) -> Self {
        let pick = |ours: u64, theirs: u64| {
            if ours == 0 || theirs == 0 {
                0
            } else {
                ours.max(theirs)
            }
        };
        Self {
            send_ms: pick(self.send_ms, server.receive_ms),
            receive_ms: pick(self.receive_ms, server.send_ms),
        }
    }
}

impl fmt::Display for HeartBeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.send_ms, self.receive_ms)
    }
}

impl FromStr for HeartBeat {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self> {
        let (send, receive) = s
            .split_once(',')
            .ok_or_else(|| BusError::protocol(format!("Malformed heart-beat '{s}'")))?;
        let parse = |v: &str| {
            v.trim()
                .parse::<u64>()
                .map_err(|e| BusError::protocol(format!("Malformed heart-beat '{s}': {e}")))
        };
        Ok(Self::new(parse(send)?, parse(receive)?))
    }
}
