//! Line framing for the actuator device protocol.
//!
//! Every command is one line `"<seq> <VERB> <args...>\n"`. The device answers
//! each command with one line that starts with the same sequence number; a
//! reply carrying the `OK` token is success, anything else is a device-side
//! failure whose text is reported verbatim. `TYPE` payloads are base64 so
//! arbitrary text never breaks framing.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

/// Mouse button named on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Button {
    Left,
    Right,
}

impl Button {
    pub fn as_str(self) -> &'static str {
        match self {
            Button::Left => "left",
            Button::Right => "right",
        }
    }
}

/// One device command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Ping,
    Abort,
    Home,
    MoveRel { dx: i32, dy: i32 },
    Click(Button),
    DoubleClick(Button),
    Chord(String),
    Sleep(u64),
    Type(String),
}

impl Command {
    pub fn verb(&self) -> &'static str {
        match self {
            Command::Ping => "PING",
            Command::Abort => "ABORT",
            Command::Home => "HOME",
            Command::MoveRel { .. } => "MOVE_REL",
            Command::Click(_) => "CLICK",
            Command::DoubleClick(_) => "DBLCLICK",
            Command::Chord(_) => "CHORD",
            Command::Sleep(_) => "SLEEP",
            Command::Type(_) => "TYPE",
        }
    }

    fn args(&self) -> Vec<String> {
        match self {
            Command::Ping | Command::Abort | Command::Home => Vec::new(),
            Command::MoveRel { dx, dy } => vec![dx.to_string(), dy.to_string()],
            Command::Click(button) | Command::DoubleClick(button) => {
                vec![button.as_str().to_string()]
            }
            Command::Chord(chord) => vec![chord.clone()],
            Command::Sleep(ms) => vec![ms.to_string()],
            Command::Type(text) => vec![STANDARD.encode(text.as_bytes())],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("argument for {verb} cannot be framed on one line: {arg:?}")]
    Unframeable { verb: &'static str, arg: String },
    #[error("malformed reply {0:?}")]
    Malformed(String),
    #[error("reply sequence mismatch: expected {expected}, got {line:?}")]
    SequenceMismatch { expected: u64, line: String },
}

/// A decoded device reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub seq: u64,
    pub ok: bool,
    /// Everything after the sequence number.
    pub body: String,
}

/// Encode a command frame, including the trailing newline.
pub fn encode(seq: u64, command: &Command) -> Result<String, WireError> {
    let mut frame = format!("{seq} {}", command.verb());
    for arg in command.args() {
        if arg.is_empty() || arg.contains(['\n', '\r']) {
            return Err(WireError::Unframeable {
                verb: command.verb(),
                arg,
            });
        }
        frame.push(' ');
        frame.push_str(&arg);
    }
    frame.push('\n');
    Ok(frame)
}

/// Parse a reply line without checking which command it answers.
pub fn parse_reply(line: &str) -> Result<Reply, WireError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (seq, body) = line
        .split_once(' ')
        .ok_or_else(|| WireError::Malformed(line.to_string()))?;
    let seq = seq
        .parse::<u64>()
        .map_err(|_| WireError::Malformed(line.to_string()))?;
    let ok = body.split_whitespace().any(|token| token == "OK");
    Ok(Reply {
        seq,
        ok,
        body: body.to_string(),
    })
}

/// Decode the reply to the command sent with `expected`.
///
/// A reply for any other sequence number is rejected even when well-formed.
pub fn decode(expected: u64, line: &str) -> Result<Reply, WireError> {
    let reply = parse_reply(line).map_err(|_| WireError::SequenceMismatch {
        expected,
        line: line.trim_end().to_string(),
    })?;
    if reply.seq != expected {
        return Err(WireError::SequenceMismatch {
            expected,
            line: line.trim_end().to_string(),
        });
    }
    Ok(reply)
}

/// Accumulates raw bytes from the transport and yields complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Next complete, non-blank line with the terminator stripped.
    pub fn next_line(&mut self) -> Option<String> {
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\r', '\n']);
            if !line.trim().is_empty() {
                return Some(line.to_string());
            }
        }
        None
    }
}
