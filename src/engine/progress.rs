//! Per-worker transfer telemetry and the console renderer.
//!
//! Workers report through the [`ProgressSink`] trait; the aggregator in
//! engine::run reads slot snapshots at a fixed interval, drains the
//! message queue and redraws the per-worker lines plus a totals line.
//! Rates are rolling averages over a ten second window (at most 100
//! samples per worker).

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::Local;
use colored::Colorize;

use super::queue::WorkQueue;
use crate::utils;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    NotStarted,
    Starting,
    Running,
    /// Synthetic state used for progress accounting only; the worker
    /// re-enters Running with an updated resume offset.
    Retrying,
    Finished,
}

/// What a worker tells the aggregator.
pub enum ProgressEvent {
    State(WorkerState),
    /// A new unit started: display name and expected byte total.
    File { name: String, total: u64 },
    /// The expected total changed (resume point discovered).
    Total(u64),
    /// Bytes arrived.
    Advance(u64),
}

pub trait ProgressSink: Send + Sync {
    fn report(&self, worker: usize, event: ProgressEvent);
}

const WINDOW: Duration = Duration::from_secs(10);
const WINDOW_SAMPLES: usize = 100;

struct WorkerSlot {
    state: WorkerState,
    filename: String,
    done: u64,
    total: u64,
    window: VecDeque<(Instant, u64)>,
}

impl WorkerSlot {
    fn new() -> WorkerSlot {
        WorkerSlot {
            state: WorkerState::NotStarted,
            filename: String::new(),
            done: 0,
            total: 0,
            window: VecDeque::new(),
        }
    }

    fn rate(&self) -> f64 {
        let (Some(first), Some(last)) = (self.window.front(), self.window.back()) else {
            return 0.0;
        };
        let elapsed = last.0.duration_since(first.0).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        (last.1 - first.1) as f64 / elapsed
    }
}

/// Snapshot handed to the renderer.
#[derive(Clone, Debug)]
pub struct WorkerSnapshot {
    pub state: WorkerState,
    pub filename: String,
    pub done: u64,
    pub total: u64,
    pub rate: f64,
}

pub struct ProgressSlots {
    slots: Vec<Mutex<WorkerSlot>>,
}

impl ProgressSlots {
    pub fn new(workers: usize) -> ProgressSlots {
        ProgressSlots {
            slots: (0..workers).map(|_| Mutex::new(WorkerSlot::new())).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn snapshot(&self, worker: usize) -> WorkerSnapshot {
        let slot = self.slots[worker].lock().unwrap();
        WorkerSnapshot {
            state: slot.state,
            filename: slot.filename.clone(),
            done: slot.done,
            total: slot.total,
            rate: slot.rate(),
        }
    }

    pub fn all_finished(&self) -> bool {
        self.slots
            .iter()
            .all(|s| s.lock().unwrap().state == WorkerState::Finished)
    }
}

impl ProgressSink for ProgressSlots {
    fn report(&self, worker: usize, event: ProgressEvent) {
        let Some(slot) = self.slots.get(worker) else {
            return;
        };
        let mut slot = slot.lock().unwrap();
        match event {
            ProgressEvent::State(state) => slot.state = state,
            ProgressEvent::File { name, total } => {
                slot.filename = name;
                slot.total = total;
                slot.done = 0;
                slot.window.clear();
            }
            ProgressEvent::Total(total) => slot.total = total,
            ProgressEvent::Advance(delta) => {
                slot.done += delta;
                let now = Instant::now();
                let done = slot.done;
                slot.window.push_back((now, done));
                while slot.window.len() > WINDOW_SAMPLES {
                    slot.window.pop_front();
                }
                while let Some(front) = slot.window.front() {
                    if now.duration_since(front.0) > WINDOW {
                        slot.window.pop_front();
                    } else {
                        break;
                    }
                }
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgKind {
    Info,
    Warning,
    Error,
    Success,
}

/// One timestamped status line from a worker.
pub struct Message {
    pub text: String,
    pub kind: MsgKind,
    pub prefix: String,
    pub timestamp: chrono::DateTime<Local>,
}

impl Message {
    pub fn new(text: impl Into<String>, kind: MsgKind, prefix: impl Into<String>) -> Message {
        Message {
            text: text.into(),
            kind,
            prefix: prefix.into(),
            timestamp: Local::now(),
        }
    }

    pub fn formatted(&self, color: bool) -> String {
        let mut line = self.text.clone();
        if !self.prefix.is_empty() {
            line = format!("{} {}", self.prefix, line);
        }
        line = format!("{} {}", self.timestamp.format("%Y-%m-%d %H:%M:%S"), line);
        if !color {
            return line;
        }
        match self.kind {
            MsgKind::Info => line,
            MsgKind::Warning => line.yellow().to_string(),
            MsgKind::Error => line.red().to_string(),
            MsgKind::Success => line.green().to_string(),
        }
    }
}

pub type MessageQueue = WorkQueue<Message>;

/// ASCII progress bar renderer; suppressed below a minimum width.
pub struct ProgressBar;

impl ProgressBar {
    pub const MIN_LENGTH: usize = 5;

    pub fn render(length: usize, fraction: f64) -> String {
        if length < Self::MIN_LENGTH {
            return String::new();
        }
        let fraction = fraction.clamp(0.0, 1.0);
        let inner = length.saturating_sub(2);
        let filled = (inner as f64 * fraction).round() as usize;
        let mut bar = String::with_capacity(length);
        bar.push('[');
        for i in 0..inner {
            if i < filled {
                bar.push('=');
            } else if i == filled && fraction < 1.0 {
                bar.push('>');
            } else {
                bar.push(' ');
            }
        }
        bar.push(']');
        bar
    }
}

/// Builds the per-worker display lines and the trailing totals line.
pub fn render_lines(
    slots: &ProgressSlots,
    remaining_queue: usize,
    remaining_bytes: u64,
    multi_worker: bool,
) -> Vec<String> {
    let term_width = utils::terminal_width();
    let mut lines = Vec::new();
    let mut total_rate = 0.0f64;
    let mut eta_sum = Duration::ZERO;
    let mut any_running = false;

    for worker in 0..slots.len() {
        let snap = slots.snapshot(worker);
        if snap.state == WorkerState::Finished {
            lines.push(format!("#{}: Finished", worker));
            continue;
        }
        any_running = true;
        total_rate += snap.rate;

        let fraction = if snap.total > 0 {
            snap.done as f64 / snap.total as f64
        } else {
            0.0
        };

        let eta = if snap.rate > 0.0 {
            Duration::from_secs_f64((snap.total.saturating_sub(snap.done)) as f64 / snap.rate)
        } else {
            Duration::ZERO
        };
        eta_sum += eta;

        let percent = format!("{:3.0}% ", fraction * 100.0);
        let status = format!(
            " {:.2}/{:.2}MB @ {} ETA: {}",
            snap.done as f64 / 1048576.0,
            snap.total as f64 / 1048576.0,
            utils::rate_string(snap.rate),
            utils::eta_string(eta)
        );

        let mut bar_length = 26usize;
        let used = percent.len() + status.len() + bar_length;
        if used > term_width {
            bar_length = bar_length.saturating_sub(used - term_width);
        }

        let name_line: String = format!("#{} {}", worker, snap.filename)
            .chars()
            .take(term_width)
            .collect();
        lines.push(name_line);
        lines.push(format!(
            "{}{}{}",
            percent,
            ProgressBar::render(bar_length, fraction),
            status
        ));
    }

    if any_running {
        let mut summary = String::new();
        if multi_worker {
            summary.push_str(&format!("Total: {} | ", utils::rate_string(total_rate)));
        }
        summary.push_str(&format!("Remaining: {}", remaining_queue));
        if remaining_bytes > 0 && total_rate > 0.0 {
            let eta = Duration::from_secs_f64(remaining_bytes as f64 / total_rate) + eta_sum;
            summary.push_str(&format!(
                " ({}) ETA: {}",
                utils::size_string(remaining_bytes),
                utils::eta_string(eta)
            ));
        }
        lines.push(summary);
    }

    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_accumulate_bytes() {
        let slots = ProgressSlots::new(2);
        slots.report(0, ProgressEvent::File { name: "a.bin".into(), total: 100 });
        slots.report(0, ProgressEvent::Advance(25));
        slots.report(0, ProgressEvent::Advance(25));
        let snap = slots.snapshot(0);
        assert_eq!(snap.done, 50);
        assert_eq!(snap.total, 100);
        assert_eq!(snap.filename, "a.bin");

        // worker 1 untouched
        assert_eq!(slots.snapshot(1).done, 0);
    }

    #[test]
    fn new_file_resets_counters() {
        let slots = ProgressSlots::new(1);
        slots.report(0, ProgressEvent::File { name: "a".into(), total: 10 });
        slots.report(0, ProgressEvent::Advance(10));
        slots.report(0, ProgressEvent::File { name: "b".into(), total: 20 });
        let snap = slots.snapshot(0);
        assert_eq!(snap.done, 0);
        assert_eq!(snap.total, 20);
    }

    #[test]
    fn all_finished_requires_every_worker() {
        let slots = ProgressSlots::new(2);
        slots.report(0, ProgressEvent::State(WorkerState::Finished));
        assert!(!slots.all_finished());
        slots.report(1, ProgressEvent::State(WorkerState::Finished));
        assert!(slots.all_finished());
    }

    #[test]
    fn out_of_range_worker_is_ignored() {
        let slots = ProgressSlots::new(1);
        slots.report(7, ProgressEvent::Advance(10));
        assert_eq!(slots.snapshot(0).done, 0);
    }

    #[test]
    fn bar_rendering() {
        assert_eq!(ProgressBar::render(4, 0.5), "");
        let bar = ProgressBar::render(12, 0.5);
        assert_eq!(bar.len(), 12);
        assert!(bar.starts_with('['));
        assert!(bar.ends_with(']'));
        assert!(bar.contains('>'));
        let full = ProgressBar::render(12, 1.0);
        assert!(!full.contains('>'));
        assert!(full.contains("=========="));
    }

    #[test]
    fn message_formatting_without_color() {
        let msg = Message::new("Download complete: a.bin", MsgKind::Success, "[Thread #1]");
        let line = msg.formatted(false);
        assert!(line.contains("[Thread #1] Download complete: a.bin"));
        // timestamp leads
        assert!(line.chars().next().unwrap().is_ascii_digit());
    }
}
