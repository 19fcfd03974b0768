//! STOMP 1.2 text frames as carried over the chat WebSocket.
//!
//! A WebSocket text message holds zero or more frames. Bare EOLs between
//! frames are heart-beats and are skipped by [`Frame::parse_all`].

use std::time::Duration;
use thiserror::Error;

use crate::models::RoomId;

pub const ACCEPT_VERSION: &str = "1.2,1.1,1.0";

/// Publish/subscribe destination carrying a room's live messages.
pub fn room_topic(room_id: RoomId) -> String {
    format!("/topic/chatroom.{room_id}")
}

// ── Commands ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    // Client -> server
    Connect,
    Subscribe,
    Unsubscribe,
    Disconnect,
    // Server -> client
    Connected,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Disconnect => "DISCONNECT",
            Command::Connected => "CONNECTED",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        let command = match raw {
            "CONNECT" => Command::Connect,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "DISCONNECT" => Command::Disconnect,
            "CONNECTED" => Command::Connected,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            _ => return None,
        };
        Some(command)
    }

    /// CONNECT and CONNECTED frames carry header values verbatim.
    fn escapes_headers(self) -> bool {
        !matches!(self, Command::Connect | Command::Connected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("malformed header line {0:?}")]
    MalformedHeader(String),
    #[error("invalid escape sequence in {0:?}")]
    InvalidEscape(String),
    #[error("invalid content-length {0:?}")]
    InvalidContentLength(String),
    #[error("frame is not terminated by NUL")]
    Unterminated,
}

// ── Frames ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Value of the first header called `name`; repeated headers after the
    /// first are ignored.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn connect(host: &str, heartbeat: Heartbeat, access_token: Option<&str>) -> Self {
        let mut frame = Frame::new(Command::Connect)
            .header("accept-version", ACCEPT_VERSION)
            .header("host", host)
            .header("heart-beat", heartbeat.header_value());
        if let Some(token) = access_token {
            frame = frame.header("Authorization", format!("Bearer {token}"));
        }
        frame
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Frame::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        Frame::new(Command::Unsubscribe).header("id", id)
    }

    pub fn disconnect() -> Self {
        Frame::new(Command::Disconnect)
    }

    pub fn encode(&self) -> String {
        let escape_headers = self.command.escapes_headers();
        let mut out = String::with_capacity(self.body.len() + 64);

        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escape_headers {
                out.push_str(&escape(name));
                out.push(':');
                out.push_str(&escape(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Parse every frame in one WebSocket text message.
    pub fn parse_all(text: &str) -> Result<Vec<Frame>, FrameError> {
        let mut frames = Vec::new();
        let mut rest = text;

        loop {
            rest = rest.trim_start_matches(['\r', '\n']);
            if rest.is_empty() {
                break;
            }
            let (frame, remaining) = parse_one(rest)?;
            frames.push(frame);
            rest = remaining;
        }

        Ok(frames)
    }
}

fn parse_one(input: &str) -> Result<(Frame, &str), FrameError> {
    let (command_line, mut rest) = split_line(input).ok_or(FrameError::Unterminated)?;
    let command = Command::parse(command_line)
        .ok_or_else(|| FrameError::UnknownCommand(command_line.to_string()))?;

    let mut headers = Vec::new();
    loop {
        let (line, after) = split_line(rest).ok_or(FrameError::Unterminated)?;
        rest = after;
        if line.is_empty() {
            break;
        }

        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
        if command.escapes_headers() {
            headers.push((unescape(name)?, unescape(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .map(|(_, v)| v.clone());

    let (body, after_body) = match content_length {
        Some(raw) => {
            let len: usize = raw
                .trim()
                .parse()
                .map_err(|_| FrameError::InvalidContentLength(raw.clone()))?;
            if len > rest.len() {
                return Err(FrameError::Unterminated);
            }
            if !rest.is_char_boundary(len) {
                return Err(FrameError::InvalidContentLength(raw));
            }
            let after = rest[len..]
                .strip_prefix('\0')
                .ok_or(FrameError::Unterminated)?;
            (&rest[..len], after)
        }
        None => {
            let end = rest.find('\0').ok_or(FrameError::Unterminated)?;
            (&rest[..end], &rest[end + 1..])
        }
    };

    let frame = Frame {
        command,
        headers,
        body: body.to_string(),
    };
    Ok((frame, after_body))
}

/// Split off one line, accepting both `\n` and `\r\n` endings.
fn split_line(input: &str) -> Option<(&str, &str)> {
    let end = input.find('\n')?;
    let line = &input[..end];
    let line = line.strip_suffix('\r').unwrap_or(line);
    Some((line, &input[end + 1..]))
}

fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(raw: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
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
            _ => return Err(FrameError::InvalidEscape(raw.to_string())),
        }
    }
    Ok(out)
}

// ── Heart-beating ──

/// A `heart-beat` header: the interval one side can send at, and the
/// interval it wants to receive at. Zero disables that direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Heartbeat {
    pub outgoing: Duration,
    pub incoming: Duration,
}

impl Heartbeat {
    pub fn new(outgoing: Duration, incoming: Duration) -> Self {
        Self { outgoing, incoming }
    }

    pub fn header_value(&self) -> String {
        format!(
            "{},{}",
            self.outgoing.as_millis(),
            self.incoming.as_millis()
        )
    }

    pub fn parse(value: &str) -> Option<Self> {
        let (outgoing, incoming) = value.split_once(',')?;
        Some(Self {
            outgoing: Duration::from_millis(outgoing.trim().parse().ok()?),
            incoming: Duration::from_millis(incoming.trim().parse().ok()?),
        })
    }

    /// Intervals to use given the server's header from CONNECTED. Each
    /// direction takes the slower of the two sides and is disabled when
    /// either side disables it.
    pub fn negotiate(&self, server: Heartbeat) -> Heartbeat {
        let pick = |ours: Duration, theirs: Duration| {
            if ours.is_zero() || theirs.is_zero() {
                Duration::ZERO
            } else {
                ours.max(theirs)
            }
        };

        Heartbeat {
            outgoing: pick(self.outgoing, server.incoming),
            incoming: pick(self.incoming, server.outgoing),
        }
    }
}
