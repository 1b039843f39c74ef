//! Actuator that posts OS-level synthetic input events through `enigo`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use enigo::{Button, Coordinate, Direction, Enigo, Key, Keyboard, Mouse, Settings};
use parking_lot::Mutex;
use tracing::{debug, instrument};

use crate::core::chord::{ChordKey, Modifier, parse_chord};
use crate::core::types::{ActuatorInfo, Point};
use crate::io::actuator::{Actuator, ActuatorError};

const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Fixed settle delays after each discrete input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntheticSettings {
    pub move_settle_ms: u64,
    pub click_settle_ms: u64,
    pub double_click_gap_ms: u64,
    pub home: Point,
}

impl Default for SyntheticSettings {
    fn default() -> Self {
        Self {
            move_settle_ms: 10,
            click_settle_ms: 20,
            double_click_gap_ms: 60,
            home: Point::new(2, 2),
        }
    }
}

/// Abort generation counter. A command captures the generation when it
/// starts and stops at the next checkpoint once the generation moves.
#[derive(Debug, Default)]
pub struct AbortSignal {
    generation: AtomicU64,
}

impl AbortSignal {
    pub fn token(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn trigger(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn check(&self, token: u64) -> Result<(), ActuatorError> {
        if self.token() == token {
            Ok(())
        } else {
            Err(ActuatorError::Aborted)
        }
    }

    /// Sleep in short slices, returning early with `Aborted` on trigger.
    pub fn sleep(&self, token: u64, duration: Duration) -> Result<(), ActuatorError> {
        let deadline = Instant::now() + duration;
        loop {
            self.check(token)?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}

pub struct SyntheticActuator {
    enigo: Mutex<Enigo>,
    settings: SyntheticSettings,
    abort: AbortSignal,
}

fn input_failed(verb: &str, err: impl std::fmt::Debug) -> ActuatorError {
    ActuatorError::CommandFailed {
        verb: verb.to_string(),
        detail: format!("{err:?}"),
    }
}

fn enigo_modifier(modifier: Modifier) -> Key {
    match modifier {
        Modifier::Command => Key::Meta,
        Modifier::Control => Key::Control,
        Modifier::Alt => Key::Alt,
        Modifier::Shift => Key::Shift,
    }
}

fn enigo_key(key: ChordKey) -> Key {
    match key {
        ChordKey::Escape => Key::Escape,
        ChordKey::Return => Key::Return,
        ChordKey::Tab => Key::Tab,
        ChordKey::Space => Key::Space,
        ChordKey::Backspace => Key::Backspace,
        ChordKey::Delete => Key::Delete,
        ChordKey::Char(c) => Key::Unicode(c),
    }
}

impl SyntheticActuator {
    pub fn new(settings: SyntheticSettings) -> Result<Self, ActuatorError> {
        let enigo = Enigo::new(&Settings::default()).map_err(|err| {
            ActuatorError::DeviceUnavailable(format!("synthetic input unavailable: {err:?}"))
        })?;
        Ok(Self {
            enigo: Mutex::new(enigo),
            settings,
            abort: AbortSignal::default(),
        })
    }

    fn settle(&self, token: u64, ms: u64) -> Result<(), ActuatorError> {
        self.abort.sleep(token, Duration::from_millis(ms))
    }

    fn click_once(&self, token: u64) -> Result<(), ActuatorError> {
        self.abort.check(token)?;
        self.enigo
            .lock()
            .button(Button::Left, Direction::Click)
            .map_err(|err| input_failed("click", err))?;
        self.settle(token, self.settings.click_settle_ms)
    }

    fn type_literal(&self, token: u64, text: &str) -> Result<(), ActuatorError> {
        let mut buf = [0u8; 4];
        for c in text.chars() {
            self.abort.check(token)?;
            self.enigo
                .lock()
                .text(c.encode_utf8(&mut buf))
                .map_err(|err| input_failed("type", err))?;
        }
        Ok(())
    }
}

impl Actuator for SyntheticActuator {
    fn info(&self) -> ActuatorInfo {
        ActuatorInfo {
            kind: "synthetic".to_string(),
            device: None,
        }
    }

    fn ping(&self) -> Result<(), ActuatorError> {
        Ok(())
    }

    fn home(&self) -> Result<(), ActuatorError> {
        self.move_to(self.settings.home)
    }

    #[instrument(skip(self))]
    fn move_to(&self, point: Point) -> Result<(), ActuatorError> {
        let token = self.abort.token();
        self.enigo
            .lock()
            .move_mouse(point.x, point.y, Coordinate::Abs)
            .map_err(|err| input_failed("move", err))?;
        self.settle(token, self.settings.move_settle_ms)
    }

    fn click(&self) -> Result<(), ActuatorError> {
        let token = self.abort.token();
        self.click_once(token)
    }

    fn double_click(&self) -> Result<(), ActuatorError> {
        let token = self.abort.token();
        self.click_once(token)?;
        self.settle(token, self.settings.double_click_gap_ms)?;
        self.click_once(token)
    }

    #[instrument(skip(self))]
    fn key_chord(&self, chord: &str) -> Result<(), ActuatorError> {
        let token = self.abort.token();
        let Some(parsed) = parse_chord(chord) else {
            debug!(chord, "unrecognized chord, typing literally");
            return self.type_literal(token, chord);
        };
        self.abort.check(token)?;
        {
            let mut enigo = self.enigo.lock();
            for modifier in &parsed.modifiers {
                enigo
                    .key(enigo_modifier(*modifier), Direction::Press)
                    .map_err(|err| input_failed("chord", err))?;
            }
            let pressed = enigo.key(enigo_key(parsed.key), Direction::Click);
            for modifier in parsed.modifiers.iter().rev() {
                enigo
                    .key(enigo_modifier(*modifier), Direction::Release)
                    .map_err(|err| input_failed("chord", err))?;
            }
            pressed.map_err(|err| input_failed("chord", err))?;
        }
        self.settle(token, self.settings.click_settle_ms)
    }

    fn type_text(&self, text: &str) -> Result<(), ActuatorError> {
        let token = self.abort.token();
        self.type_literal(token, text)?;
        self.settle(token, self.settings.click_settle_ms)
    }

    fn sleep_ms(&self, ms: u64) -> Result<(), ActuatorError> {
        let token = self.abort.token();
        self.abort.sleep(token, Duration::from_millis(ms))
    }

    fn abort(&self) -> Result<(), ActuatorError> {
        debug!("aborting synthetic input");
        self.abort.trigger();
        Ok(())
    }
}
