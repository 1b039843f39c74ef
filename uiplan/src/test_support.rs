//! Scripted collaborators and fixtures for tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use image::{Rgba, RgbaImage};
use parking_lot::Mutex;

use crate::core::frame::{Frame, PixelOrigin};
use crate::core::regions::Regions;
use crate::core::types::{ActuatorInfo, OcrLine, Point, Rect};
use crate::io::actuator::{Actuator, ActuatorError};
use crate::io::frames::{FrameError, FrameGrabber, FrameProvider};
use crate::io::ocr::TextRecognizer;
use crate::io::protocol::ProtocolClient;
use crate::io::synthetic::AbortSignal;

type Responder = Box<dyn Fn(u64, &str) -> Option<String> + Send>;

struct DeviceState {
    responder: Responder,
    partial: Vec<u8>,
    written: Vec<String>,
    pending: VecDeque<u8>,
    fail_writes: bool,
}

/// In-memory stand-in for the serial device. Each complete line written is
/// passed to the responder together with its sequence number; a `Some`
/// reply becomes readable immediately.
#[derive(Clone)]
pub struct FakeDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl FakeDevice {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(u64, &str) -> Option<String> + Send + 'static,
    {
        Self {
            state: Arc::new(Mutex::new(DeviceState {
                responder: Box::new(responder),
                partial: Vec::new(),
                written: Vec::new(),
                pending: VecDeque::new(),
                fail_writes: false,
            })),
        }
    }

    /// Answers every frame with `<seq> OK`.
    pub fn replying_ok() -> Self {
        Self::new(|seq, _line| Some(format!("{seq} OK")))
    }

    pub fn client(&self, read_timeout: Duration) -> ProtocolClient {
        ProtocolClient::new(
            "fake",
            Box::new(DeviceReader(self.clone())),
            Box::new(DeviceWriter(self.clone())),
            read_timeout,
        )
    }

    pub fn written_lines(&self) -> Vec<String> {
        self.state.lock().written.clone()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    /// Make an unsolicited reply line readable.
    pub fn push_reply(&self, line: &str) {
        let mut state = self.state.lock();
        state.pending.extend(line.as_bytes());
        state.pending.push_back(b'\n');
    }
}

struct DeviceReader(FakeDevice);

impl Read for DeviceReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.0.state.lock();
        let n = buf.len().min(state.pending.len());
        for (slot, byte) in buf.iter_mut().zip(state.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

struct DeviceWriter(FakeDevice);

impl Write for DeviceWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.0.state.lock();
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
        }
        state.partial.extend_from_slice(buf);
        while let Some(pos) = state.partial.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = state.partial.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..pos]).trim_end().to_string();
            let seq = line
                .split_whitespace()
                .next()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            let reply = (state.responder)(seq, &line);
            state.written.push(line);
            if let Some(reply) = reply {
                state.pending.extend(reply.as_bytes());
                state.pending.push_back(b'\n');
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A call observed by [`RecordingActuator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Ping,
    Home,
    MoveTo(Point),
    Click,
    DoubleClick,
    KeyChord(String),
    TypeText(String),
    SleepMs(u64),
    Abort,
}

impl Call {
    fn verb(&self) -> &'static str {
        match self {
            Call::Ping => "ping",
            Call::Home => "home",
            Call::MoveTo(_) => "move_to",
            Call::Click => "click",
            Call::DoubleClick => "double_click",
            Call::KeyChord(_) => "key_chord",
            Call::TypeText(_) => "type_text",
            Call::SleepMs(_) => "sleep_ms",
            Call::Abort => "abort",
        }
    }
}

/// Actuator that records calls instead of moving anything. Failures and
/// hangs are scripted per verb (`"click"`, `"key_chord"`, `"sleep_ms"`...).
#[derive(Default)]
pub struct RecordingActuator {
    calls: Mutex<Vec<Call>>,
    link_down: AtomicBool,
    failing: Mutex<BTreeMap<&'static str, String>>,
    hanging: Mutex<Vec<&'static str>>,
    signal: AbortSignal,
}

impl RecordingActuator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Clicks and double clicks with the preceding pointer target.
    pub fn clicked_points(&self) -> Vec<Point> {
        let mut last = None;
        let mut points = Vec::new();
        for call in self.calls.lock().iter() {
            match call {
                Call::MoveTo(p) => last = Some(*p),
                Call::Click | Call::DoubleClick => points.extend(last),
                _ => {}
            }
        }
        points
    }

    /// Every call fails with an I/O error while set.
    pub fn fail_link(&self, down: bool) {
        self.link_down.store(down, Ordering::SeqCst);
    }

    pub fn fail_verb(&self, verb: &'static str, detail: &str) {
        self.failing.lock().insert(verb, detail.to_string());
    }

    /// Calls of `verb` block until [`Actuator::abort`] is called.
    pub fn hang_on(&self, verb: &'static str) {
        self.hanging.lock().push(verb);
    }

    fn record(&self, call: Call) -> Result<(), ActuatorError> {
        let token = self.signal.token();
        let verb = call.verb();
        self.calls.lock().push(call);
        if self.link_down.load(Ordering::SeqCst) {
            return Err(ActuatorError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "link down",
            )));
        }
        if let Some(detail) = self.failing.lock().get(verb) {
            return Err(ActuatorError::CommandFailed {
                verb: verb.to_string(),
                detail: detail.clone(),
            });
        }
        if self.hanging.lock().contains(&verb) {
            self.signal.sleep(token, Duration::from_secs(60))?;
        }
        Ok(())
    }
}

impl Actuator for RecordingActuator {
    fn info(&self) -> ActuatorInfo {
        ActuatorInfo {
            kind: "recording".to_string(),
            device: None,
        }
    }

    fn ping(&self) -> Result<(), ActuatorError> {
        self.record(Call::Ping)
    }

    fn home(&self) -> Result<(), ActuatorError> {
        self.record(Call::Home)
    }

    fn move_to(&self, point: Point) -> Result<(), ActuatorError> {
        self.record(Call::MoveTo(point))
    }

    fn click(&self) -> Result<(), ActuatorError> {
        self.record(Call::Click)
    }

    fn double_click(&self) -> Result<(), ActuatorError> {
        self.record(Call::DoubleClick)
    }

    fn key_chord(&self, chord: &str) -> Result<(), ActuatorError> {
        self.record(Call::KeyChord(chord.to_string()))
    }

    fn type_text(&self, text: &str) -> Result<(), ActuatorError> {
        self.record(Call::TypeText(text.to_string()))
    }

    fn sleep_ms(&self, ms: u64) -> Result<(), ActuatorError> {
        self.record(Call::SleepMs(ms))
    }

    fn abort(&self) -> Result<(), ActuatorError> {
        self.calls.lock().push(Call::Abort);
        self.signal.trigger();
        Ok(())
    }
}

/// Grabber producing solid grey frames of a fixed size.
pub struct SolidGrabber {
    width: u32,
    height: u32,
}

impl SolidGrabber {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl FrameGrabber for SolidGrabber {
    fn grab(&mut self, seq: u64) -> Result<Frame, FrameError> {
        Ok(solid_frame(self.width, self.height, seq))
    }
}

pub fn solid_frame(width: u32, height: u32, seq: u64) -> Frame {
    Frame::new(
        RgbaImage::from_pixel(width, height, Rgba([128, 128, 128, 255])),
        PixelOrigin::TopLeft,
        1.0,
        seq,
    )
}

/// Which `FrameProvider` method served a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRead {
    Latest,
    After,
}

/// Frame provider that captures a fresh solid frame on every request, so
/// `frame_after` never waits. Records how each frame was asked for.
pub struct SolidFrames {
    width: u32,
    height: u32,
    seq: AtomicU64,
    reads: Mutex<Vec<FrameRead>>,
}

impl SolidFrames {
    pub fn new(width: u32, height: u32) -> Arc<Self> {
        Arc::new(Self {
            width,
            height,
            seq: AtomicU64::new(0),
            reads: Mutex::new(Vec::new()),
        })
    }

    pub fn reads(&self) -> Vec<FrameRead> {
        self.reads.lock().clone()
    }

    fn next(&self, read: FrameRead) -> Frame {
        self.reads.lock().push(read);
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        solid_frame(self.width, self.height, seq)
    }
}

impl FrameProvider for SolidFrames {
    fn latest_frame(&self, _timeout: Duration) -> Result<Frame, FrameError> {
        Ok(self.next(FrameRead::Latest))
    }

    fn frame_after(&self, _since: Instant, _timeout: Duration) -> Result<Frame, FrameError> {
        Ok(self.next(FrameRead::After))
    }
}

/// Recognizer answering by crop size, which identifies the region in tests.
/// A scripted sequence is consumed one response per call; the last response
/// repeats. Unscripted sizes recognize nothing.
#[derive(Default)]
pub struct ScriptedRecognizer {
    scripts: Mutex<HashMap<(u32, u32), VecDeque<Vec<OcrLine>>>>,
    calls: AtomicU64,
}

impl ScriptedRecognizer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn always(&self, size: (u32, u32), lines: Vec<OcrLine>) {
        self.script(size, vec![lines]);
    }

    pub fn script(&self, size: (u32, u32), responses: Vec<Vec<OcrLine>>) {
        self.scripts.lock().insert(size, responses.into());
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TextRecognizer for ScriptedRecognizer {
    fn recognize(&self, image: &RgbaImage) -> anyhow::Result<Vec<OcrLine>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut scripts = self.scripts.lock();
        let Some(queue) = scripts.get_mut(&(image.width(), image.height())) else {
            return Ok(Vec::new());
        };
        let lines = if queue.len() > 1 {
            queue.pop_front().unwrap_or_default()
        } else {
            queue.front().cloned().unwrap_or_default()
        };
        Ok(lines)
    }
}

/// A confident recognized line.
pub fn line(text: &str, bbox: Rect) -> OcrLine {
    OcrLine {
        text: text.to_string(),
        confidence: 0.92,
        bbox,
    }
}

pub fn regions(entries: &[(&str, Rect)]) -> Regions {
    entries
        .iter()
        .map(|(id, rect)| (id.to_string(), *rect))
        .collect()
}

/// Fresh temporary directory for a run.
pub fn run_dir() -> tempfile::TempDir {
    tempfile::tempdir().expect("tempdir")
}

pub fn write_fixture(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).expect("write fixture");
    path
}
