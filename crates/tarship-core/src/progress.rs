//! Progress reporting
//!
//! The operation driving a transfer owns a [`Progress`] handle and pushes
//! events into a [`ProgressSink`]. Sinks only observe: they can't fail the
//! operation, and how often they render is their own business.
//!
//! ```text
//! pack/ship/unpack ──advance(delta)──► Progress ──ProgressEvent──► sink
//!                                      (state)                  (log, terminal, closure)
//! ```

use std::cell::Cell;
use std::io::Write;
use std::time::{Duration, Instant};

use tracing::info;

/// What a progress counter counts
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressUnit {
    Bytes,
    Items,
}

/// Snapshot of a running operation's progress
#[derive(Clone, Debug)]
pub struct ProgressState {
    pub label: String,
    pub unit: ProgressUnit,
    pub total: Option<u64>,
    pub current: u64,
    started: Instant,
}

impl ProgressState {
    fn new(label: impl Into<String>, unit: ProgressUnit, total: Option<u64>) -> Self {
        Self {
            label: label.into(),
            unit,
            total,
            current: 0,
            started: Instant::now(),
        }
    }

    /// Completion percentage, if the total is known
    pub fn percent(&self) -> Option<f64> {
        self.total.map(|total| {
            if total == 0 {
                100.0
            } else {
                (self.current as f64 / total as f64) * 100.0
            }
        })
    }

    /// Time since the operation started
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Average throughput in units per second
    pub fn rate(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.current as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Estimated time remaining, if the total is known and we are moving
    pub fn eta(&self) -> Option<Duration> {
        let total = self.total?;
        let rate = self.rate();
        if rate <= 0.0 {
            return None;
        }
        let remaining = total.saturating_sub(self.current);
        Some(Duration::from_secs_f64(remaining as f64 / rate))
    }

    /// Human-readable one-line summary
    pub fn render(&self) -> String {
        let amount = match (self.unit, self.total) {
            (ProgressUnit::Bytes, Some(total)) => {
                format!("{} / {}", format_bytes(self.current), format_bytes(total))
            }
            (ProgressUnit::Bytes, None) => format_bytes(self.current),
            (ProgressUnit::Items, Some(total)) => format!("{} / {} items", self.current, total),
            (ProgressUnit::Items, None) => format!("{} items", self.current),
        };

        let rate = match self.unit {
            ProgressUnit::Bytes => format!("{}/s", format_bytes(self.rate() as u64)),
            ProgressUnit::Items => format!("{:.0} items/s", self.rate()),
        };

        let mut line = format!("{}: {}", self.label, amount);
        if let Some(percent) = self.percent() {
            line.push_str(&format!(" ({:.1}%)", percent));
        }
        line.push_str(&format!(" {}", rate));
        if let Some(eta) = self.eta() {
            line.push_str(&format!(" eta {}", format_duration(eta)));
        }
        line
    }
}

/// Event delivered to a sink
#[derive(Debug)]
pub enum ProgressEvent<'a> {
    Started { state: &'a ProgressState },
    Advanced { delta: u64, state: &'a ProgressState },
    Finished { state: &'a ProgressState },
}

impl<'a> ProgressEvent<'a> {
    pub fn state(&self) -> &'a ProgressState {
        match self {
            ProgressEvent::Started { state }
            | ProgressEvent::Advanced { state, .. }
            | ProgressEvent::Finished { state } => state,
        }
    }
}

/// Observer of progress events
pub trait ProgressSink {
    fn on_event(&self, event: &ProgressEvent<'_>);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressEvent<'_>),
{
    fn on_event(&self, event: &ProgressEvent<'_>) {
        self(event)
    }
}

/// Progress handle owned by the operation being measured.
///
/// Emits `Finished` exactly once, either through [`Progress::finish`] or
/// when dropped on an error path.
pub struct Progress<'a> {
    state: ProgressState,
    sink: &'a dyn ProgressSink,
    finished: bool,
}

impl<'a> Progress<'a> {
    pub fn new(
        sink: &'a dyn ProgressSink,
        label: impl Into<String>,
        unit: ProgressUnit,
        total: Option<u64>,
    ) -> Self {
        let state = ProgressState::new(label, unit, total);
        sink.on_event(&ProgressEvent::Started { state: &state });
        Self {
            state,
            sink,
            finished: false,
        }
    }

    /// Record `delta` more units of work
    pub fn advance(&mut self, delta: u64) {
        if delta == 0 {
            return;
        }
        self.state.current = self.state.current.saturating_add(delta);
        self.sink.on_event(&ProgressEvent::Advanced {
            delta,
            state: &self.state,
        });
    }

    /// Move to an absolute position. Positions behind the current one are
    /// ignored so the counter never goes backwards.
    pub fn set_position(&mut self, position: u64) {
        if position > self.state.current {
            self.advance(position - self.state.current);
        }
    }

    pub fn state(&self) -> &ProgressState {
        &self.state
    }

    pub fn finish(mut self) {
        self.emit_finished();
    }

    fn emit_finished(&mut self) {
        if !self.finished {
            self.finished = true;
            self.sink.on_event(&ProgressEvent::Finished { state: &self.state });
        }
    }
}

impl Drop for Progress<'_> {
    fn drop(&mut self) {
        self.emit_finished();
    }
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressSink for NullProgress {
    fn on_event(&self, _event: &ProgressEvent<'_>) {}
}

/// Sink that writes throttled progress lines through `tracing`
#[derive(Debug)]
pub struct LogProgress {
    interval: Duration,
    last: Cell<Option<Instant>>,
}

impl LogProgress {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Cell::new(None),
        }
    }

    fn due(&self) -> bool {
        let now = Instant::now();
        match self.last.get() {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last.set(Some(now));
                true
            }
        }
    }
}

impl Default for LogProgress {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl ProgressSink for LogProgress {
    fn on_event(&self, event: &ProgressEvent<'_>) {
        match event {
            ProgressEvent::Started { state } => {
                self.last.set(Some(Instant::now()));
                info!("{} started", state.label);
            }
            ProgressEvent::Advanced { state, .. } => {
                if self.due() {
                    info!("{}", state.render());
                }
            }
            ProgressEvent::Finished { state } => {
                info!("{} finished in {}", state.render(), format_duration(state.elapsed()));
            }
        }
    }
}

/// Sink that redraws a single status line on stderr
#[derive(Debug)]
pub struct TerminalProgress {
    interval: Duration,
    last: Cell<Option<Instant>>,
}

impl TerminalProgress {
    /// Width of the bar portion in characters
    const BAR_WIDTH: usize = 30;

    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Cell::new(None),
        }
    }

    fn draw(&self, state: &ProgressState) {
        let bar = match state.percent() {
            Some(percent) => {
                let filled = ((percent.min(100.0) / 100.0) * Self::BAR_WIDTH as f64) as usize;
                format!(
                    "[{}{}] ",
                    "#".repeat(filled),
                    "-".repeat(Self::BAR_WIDTH - filled)
                )
            }
            None => String::new(),
        };
        let mut stderr = std::io::stderr().lock();
        // Display errors are not our caller's problem
        let _ = write!(stderr, "\r\x1b[2K{}{}", bar, state.render());
        let _ = stderr.flush();
    }
}

impl Default for TerminalProgress {
    fn default() -> Self {
        Self::new(Duration::from_millis(250))
    }
}

impl ProgressSink for TerminalProgress {
    fn on_event(&self, event: &ProgressEvent<'_>) {
        match event {
            ProgressEvent::Started { state } => {
                self.last.set(Some(Instant::now()));
                self.draw(state);
            }
            ProgressEvent::Advanced { state, .. } => {
                let now = Instant::now();
                let due = match self.last.get() {
                    Some(last) => now.duration_since(last) >= self.interval,
                    None => true,
                };
                if due {
                    self.last.set(Some(now));
                    self.draw(state);
                }
            }
            ProgressEvent::Finished { state } => {
                self.draw(state);
                let _ = writeln!(std::io::stderr());
            }
        }
    }
}

/// Format a byte count as a human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;

    let b = bytes as f64;
    if b >= GB {
        format!("{:.2} GiB", b / GB)
    } else if b >= MB {
        format!("{:.2} MiB", b / MB)
    } else if b >= KB {
        format!("{:.2} KiB", b / KB)
    } else {
        format!("{} B", bytes)
    }
}

/// Format a duration as `1h02m03s`, `2m03s` or `3s`
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h{:02}m{:02}s", h, m, s)
    } else if m > 0 {
        format!("{}m{:02}s", m, s)
    } else {
        format!("{}s", s)
    }
}
