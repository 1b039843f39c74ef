//! Background screen capture into a bounded frame ring.
//!
//! A single producer thread grabs frames at a fixed interval and pushes them
//! into [`FrameBuffer`]; readers block on a condition variable until a frame
//! (or a frame newer than some instant) is available. [`FrameSource`] owns
//! the producer and stops it when dropped, so capture never outlives the run
//! that started it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use image::RgbaImage;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};
use xcap::Monitor;

use crate::core::frame::{Frame, PixelOrigin};

pub const DEFAULT_CAPACITY: usize = 8;

const STOP_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("no frame available within {timeout_ms} ms")]
    NoFrames { timeout_ms: u64 },
    #[error("screen capture failed: {0}")]
    Capture(String),
}

/// Read side of a frame source.
pub trait FrameProvider: Send + Sync {
    /// Newest frame, waiting up to `timeout` for the first one.
    fn latest_frame(&self, timeout: Duration) -> Result<Frame, FrameError>;
    /// Newest frame captured after `since`, waiting up to `timeout`.
    fn frame_after(&self, since: Instant, timeout: Duration) -> Result<Frame, FrameError>;
}

/// Produces one frame per call. Lives on the producer thread.
pub trait FrameGrabber {
    fn grab(&mut self, seq: u64) -> Result<Frame, FrameError>;
}

pub struct FrameBuffer {
    frames: Mutex<VecDeque<Frame>>,
    ready: Condvar,
    capacity: usize,
}

impl FrameBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            ready: Condvar::new(),
            capacity,
        }
    }

    pub fn push(&self, frame: Frame) {
        let mut frames = self.frames.lock();
        if frames.len() == self.capacity {
            frames.pop_front();
        }
        frames.push_back(frame);
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn wait_for(
        &self,
        timeout: Duration,
        accept: impl Fn(&Frame) -> bool,
    ) -> Result<Frame, FrameError> {
        let deadline = Instant::now() + timeout;
        let mut frames = self.frames.lock();
        loop {
            if let Some(frame) = frames.back()
                && accept(frame)
            {
                return Ok(frame.clone());
            }
            if self.ready.wait_until(&mut frames, deadline).timed_out() {
                return match frames.back() {
                    Some(frame) if accept(frame) => Ok(frame.clone()),
                    _ => Err(FrameError::NoFrames {
                        timeout_ms: timeout.as_millis() as u64,
                    }),
                };
            }
        }
    }
}

impl FrameProvider for FrameBuffer {
    fn latest_frame(&self, timeout: Duration) -> Result<Frame, FrameError> {
        self.wait_for(timeout, |_| true)
    }

    fn frame_after(&self, since: Instant, timeout: Duration) -> Result<Frame, FrameError> {
        self.wait_for(timeout, |frame| frame.captured_at > since)
    }
}

/// Owns the capture thread. Dropping it stops and joins the producer.
pub struct FrameSource {
    buffer: Arc<FrameBuffer>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FrameSource {
    /// Start capturing. `make_grabber` runs on the producer thread; its
    /// failure is returned here and no thread is left behind.
    pub fn start<F>(make_grabber: F, interval: Duration, capacity: usize) -> Result<Self, FrameError>
    where
        F: FnOnce() -> Result<Box<dyn FrameGrabber>, FrameError> + Send + 'static,
    {
        let buffer = Arc::new(FrameBuffer::new(capacity));
        let stop = Arc::new(AtomicBool::new(false));
        let (init_tx, init_rx) = mpsc::channel();

        let handle = {
            let buffer = Arc::clone(&buffer);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("frame-capture".to_string())
                .spawn(move || {
                    let mut grabber = match make_grabber() {
                        Ok(grabber) => {
                            let _ = init_tx.send(Ok(()));
                            grabber
                        }
                        Err(err) => {
                            let _ = init_tx.send(Err(err));
                            return;
                        }
                    };
                    produce(grabber.as_mut(), &buffer, &stop, interval);
                })
                .map_err(|err| FrameError::Capture(format!("spawn capture thread: {err}")))?
        };

        let init = init_rx
            .recv()
            .unwrap_or_else(|_| Err(FrameError::Capture("capture thread exited".to_string())));
        if let Err(err) = init {
            let _ = handle.join();
            return Err(err);
        }
        info!(interval_ms = interval.as_millis() as u64, capacity, "frame capture started");
        Ok(Self {
            buffer,
            stop,
            handle: Some(handle),
        })
    }

    pub fn buffer(&self) -> Arc<FrameBuffer> {
        Arc::clone(&self.buffer)
    }

    /// Stop and join the producer. Idempotent.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("frame capture thread panicked");
            }
            debug!("frame capture stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn produce(grabber: &mut dyn FrameGrabber, buffer: &FrameBuffer, stop: &AtomicBool, interval: Duration) {
    let mut seq = 0u64;
    let mut failing = false;
    while !stop.load(Ordering::SeqCst) {
        seq += 1;
        match grabber.grab(seq) {
            Ok(frame) => {
                if failing {
                    info!("screen capture recovered");
                    failing = false;
                }
                buffer.push(frame);
            }
            Err(err) => {
                if !failing {
                    warn!(err = %err, "screen capture failed");
                    failing = true;
                }
            }
        }
        let wake = Instant::now() + interval;
        while !stop.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= wake {
                break;
            }
            thread::sleep(STOP_POLL.min(wake - now));
        }
    }
}

/// Captures the primary monitor with `xcap`.
pub struct XcapGrabber {
    monitor: Monitor,
    origin: PixelOrigin,
}

impl XcapGrabber {
    /// `origin` declares the row order of what the platform hands back.
    pub fn primary(origin: PixelOrigin) -> Result<Self, FrameError> {
        let monitors = Monitor::all().map_err(|err| FrameError::Capture(err.to_string()))?;
        let index = monitors.iter().position(|m| m.is_primary()).unwrap_or(0);
        let monitor = monitors
            .into_iter()
            .nth(index)
            .ok_or_else(|| FrameError::Capture("no monitors found".to_string()))?;
        Ok(Self { monitor, origin })
    }

    /// One-off capture outside a running source.
    pub fn capture_once(origin: PixelOrigin) -> Result<Frame, FrameError> {
        Self::primary(origin)?.grab(1)
    }
}

impl FrameGrabber for XcapGrabber {
    fn grab(&mut self, seq: u64) -> Result<Frame, FrameError> {
        let image: RgbaImage = self
            .monitor
            .capture_image()
            .map_err(|err| FrameError::Capture(err.to_string()))?;
        let scale = f64::from(self.monitor.scale_factor());
        let scale = if scale > 0.0 { scale } else { 1.0 };
        Ok(Frame::new(image, self.origin, scale, seq))
    }
}
