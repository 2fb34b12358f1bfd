//! STOMP 1.2 frames and their wire codec

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::str::FromStr;
use tokio_util::codec::{Decoder, Encoder};

pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown command '{0}'")]
    UnknownCommand(String),

    #[error("Malformed header line '{0}'")]
    MalformedHeader(String),

    #[error("Invalid escape sequence in header '{0}'")]
    InvalidEscape(String),

    #[error("Frame headers are not valid UTF-8")]
    InvalidUtf8,

    #[error("Invalid content-length '{0}'")]
    InvalidContentLength(String),

    #[error("Body is not terminated by NUL")]
    MissingNul,

    #[error("Frame exceeds {0} bytes")]
    TooLarge(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Disconnect => "DISCONNECT",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    /// CONNECT and CONNECTED headers are sent raw, everything else is escaped
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

impl FromStr for Command {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "ACK" => Command::Ack,
            "NACK" => Command::Nack,
            "DISCONNECT" => Command::Disconnect,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            other => return Err(FrameError::UnknownCommand(other.to_string())),
        })
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub command: Command,
    /// In wire order; repeated names are kept but only the first counts
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set a text body.
    ///
    /// `content-length` is only added when the body holds a NUL: Artemis turns
    /// frames without it into JMS text messages, which is what listeners expect.
    pub fn text_body(mut self, body: impl Into<String>) -> Self {
        let body: String = body.into();
        if body.as_bytes().contains(&0) {
            self.headers
                .push(("content-length".to_string(), body.len().to_string()));
        }
        self.body = Bytes::from(body);
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn body_text(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.body)
    }
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(value: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(FrameError::InvalidEscape(value.to_string())),
        }
    }
    Ok(out)
}

/// tokio-util codec for STOMP frames
#[derive(Debug, Clone)]
pub struct StompCodec {
    max_frame_bytes: usize,
}

impl StompCodec {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

impl Default for StompCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Decoder for StompCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        // Heart-beats
        loop {
            if src.starts_with(b"\n") {
                src.advance(1);
            } else if src.starts_with(b"\r\n") {
                src.advance(2);
            } else {
                break;
            }
        }
        if src.is_empty() || src.as_ref() == b"\r" {
            return Ok(None);
        }

        let mut lines = Vec::new();
        let mut pos = 0;
        loop {
            let Some(newline) = src[pos..].iter().position(|b| *b == b'\n') else {
                if src.len() > self.max_frame_bytes {
                    return Err(FrameError::TooLarge(self.max_frame_bytes));
                }
                return Ok(None);
            };
            let mut line = &src[pos..pos + newline];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            pos += newline + 1;
            if line.is_empty() {
                break;
            }
            let line = std::str::from_utf8(line).map_err(|_| FrameError::InvalidUtf8)?;
            lines.push(line.to_string());
        }

        let mut lines = lines.into_iter();
        let command: Command = lines.next().unwrap_or_default().parse()?;

        let mut headers = Vec::new();
        for line in lines {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::MalformedHeader(line.clone()))?;
            if command.escapes_headers() {
                headers.push((unescape(name)?, unescape(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let content_length = headers
            .iter()
            .find(|(name, _)| name == "content-length")
            .map(|(_, value)| {
                value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| FrameError::InvalidContentLength(value.clone()))
            })
            .transpose()?;

        let body_end = match content_length {
            Some(len) => {
                // content-length comes off the wire; it may be anything
                let frame_end = pos
                    .checked_add(len)
                    .and_then(|end| end.checked_add(1))
                    .filter(|end| *end <= self.max_frame_bytes)
                    .ok_or(FrameError::TooLarge(self.max_frame_bytes))?;
                if src.len() < frame_end {
                    src.reserve(frame_end - src.len());
                    return Ok(None);
                }
                if src[pos + len] != 0 {
                    return Err(FrameError::MissingNul);
                }
                pos + len
            }
            None => match src[pos..].iter().position(|b| *b == 0) {
                Some(offset) => pos + offset,
                None => {
                    if src.len() > self.max_frame_bytes {
                        return Err(FrameError::TooLarge(self.max_frame_bytes));
                    }
                    return Ok(None);
                }
            },
        };

        let body = Bytes::copy_from_slice(&src[pos..body_end]);
        src.advance(body_end + 1);

        Ok(Some(Frame {
            command,
            headers,
            body,
        }))
    }
}

impl Encoder<Frame> for StompCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        dst.put_slice(frame.command.as_str().as_bytes());
        dst.put_u8(b'\n');
        for (name, value) in &frame.headers {
            if frame.command.escapes_headers() {
                dst.put_slice(escape(name).as_bytes());
                dst.put_u8(b':');
                dst.put_slice(escape(value).as_bytes());
            } else {
                dst.put_slice(name.as_bytes());
                dst.put_u8(b':');
                dst.put_slice(value.as_bytes());
            }
            dst.put_u8(b'\n');
        }
        dst.put_u8(b'\n');
        dst.put_slice(&frame.body);
        dst.put_u8(0);
        Ok(())
    }
}
