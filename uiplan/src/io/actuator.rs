//! Actuator abstraction over input-injection backends.
//!
//! The [`Actuator`] trait decouples the engine from how input reaches the
//! target machine: a USB device speaking the line protocol
//! ([`HardwareActuator`]) or OS synthetic events
//! ([`crate::io::synthetic::SyntheticActuator`]). Both take screen points
//! with a top-left origin. Tests use recording actuators that never touch
//! the OS.

use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, instrument};

use crate::core::types::{ActuatorInfo, Point};
use crate::core::wire::{Button, Command, WireError};
use crate::io::protocol::ProtocolClient;

/// Extra reply budget per typed character.
const TYPE_MS_PER_CHAR: u64 = 10;

#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error("protocol mismatch: expected reply to seq {expected}, got {line:?}")]
    ProtocolMismatch { expected: u64, line: String },
    #[error("no reply to seq {seq} within {timeout_ms} ms")]
    ReadTimeout { seq: u64, timeout_ms: u64 },
    #[error("actuator unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("{verb} failed: {detail}")]
    CommandFailed { verb: String, detail: String },
    #[error("command aborted")]
    Aborted,
    #[error("actuator lost, reconnect failed: {0}")]
    ReconnectFailed(String),
    #[error("invalid command: {0}")]
    InvalidCommand(#[from] WireError),
    #[error("actuator i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl ActuatorError {
    /// Errors that indicate the link itself is broken and worth reconnecting.
    pub fn is_link_fault(&self) -> bool {
        matches!(
            self,
            ActuatorError::Io(_)
                | ActuatorError::ReadTimeout { .. }
                | ActuatorError::ProtocolMismatch { .. }
        )
    }

    /// Errors after which no further command can succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ActuatorError::ReconnectFailed(_))
    }
}

/// Input-injection capability set.
pub trait Actuator: Send + Sync {
    fn info(&self) -> ActuatorInfo;
    /// Liveness probe.
    fn ping(&self) -> Result<(), ActuatorError>;
    fn home(&self) -> Result<(), ActuatorError>;
    /// Move the pointer to an absolute screen point.
    fn move_to(&self, point: Point) -> Result<(), ActuatorError>;
    /// Click at the current pointer location.
    fn click(&self) -> Result<(), ActuatorError>;
    fn double_click(&self) -> Result<(), ActuatorError>;
    fn key_chord(&self, chord: &str) -> Result<(), ActuatorError>;
    fn type_text(&self, text: &str) -> Result<(), ActuatorError>;
    fn sleep_ms(&self, ms: u64) -> Result<(), ActuatorError>;
    /// Cancel whatever is in flight. Must not wait for the in-flight command.
    fn abort(&self) -> Result<(), ActuatorError>;
}

/// Serial line settings for the hardware device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialSettings {
    pub baud: u32,
    pub read_timeout: Duration,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud: 115_200,
            read_timeout: Duration::from_millis(2000),
        }
    }
}

/// Actuator backed by the USB input device.
pub struct HardwareActuator {
    client: ProtocolClient,
}

impl HardwareActuator {
    pub fn new(client: ProtocolClient) -> Self {
        Self { client }
    }

    /// Open the device at `path` in raw mode.
    #[cfg(unix)]
    pub fn open(path: &Path, settings: &SerialSettings) -> Result<Self, ActuatorError> {
        let (reader, writer) = crate::io::serial::open_raw(path, settings.baud)?;
        Ok(Self::new(ProtocolClient::new(
            path.display().to_string(),
            Box::new(reader),
            Box::new(writer),
            settings.read_timeout,
        )))
    }

    #[cfg(not(unix))]
    pub fn open(path: &Path, _settings: &SerialSettings) -> Result<Self, ActuatorError> {
        Err(ActuatorError::DeviceUnavailable(format!(
            "serial devices are not supported on this platform ({})",
            path.display()
        )))
    }

    fn send(&self, command: Command) -> Result<(), ActuatorError> {
        self.client.send(&command).map(|_| ())
    }

    fn send_long(&self, command: Command, extra: Duration) -> Result<(), ActuatorError> {
        let timeout = self.client.read_timeout() + extra;
        self.client.send_with_timeout(&command, timeout).map(|_| ())
    }
}

impl Actuator for HardwareActuator {
    fn info(&self) -> ActuatorInfo {
        ActuatorInfo {
            kind: "hardware".to_string(),
            device: Some(self.client.device().to_string()),
        }
    }

    fn ping(&self) -> Result<(), ActuatorError> {
        self.send(Command::Ping)
    }

    fn home(&self) -> Result<(), ActuatorError> {
        self.send(Command::Home)
    }

    /// The device only moves relatively; home first so the move is absolute.
    #[instrument(skip(self))]
    fn move_to(&self, point: Point) -> Result<(), ActuatorError> {
        self.send(Command::Home)?;
        self.send(Command::MoveRel {
            dx: point.x,
            dy: point.y,
        })
    }

    fn click(&self) -> Result<(), ActuatorError> {
        self.send(Command::Click(Button::Left))
    }

    fn double_click(&self) -> Result<(), ActuatorError> {
        self.send(Command::DoubleClick(Button::Left))
    }

    fn key_chord(&self, chord: &str) -> Result<(), ActuatorError> {
        self.send(Command::Chord(chord.trim().to_string()))
    }

    fn type_text(&self, text: &str) -> Result<(), ActuatorError> {
        let extra = Duration::from_millis(TYPE_MS_PER_CHAR * text.chars().count() as u64);
        self.send_long(Command::Type(text.to_string()), extra)
    }

    fn sleep_ms(&self, ms: u64) -> Result<(), ActuatorError> {
        self.send_long(Command::Sleep(ms), Duration::from_millis(ms))
    }

    fn abort(&self) -> Result<(), ActuatorError> {
        debug!(device = self.client.device(), "sending out-of-band abort");
        self.client.interrupt()
    }
}
