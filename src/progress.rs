//! Rate-limited progress reporting for a single blob transfer.
//!
//! Transfers call back from several worker threads at once with the number of
//! bytes they just moved. The meter folds those into one running total and
//! produces:
//! - a periodic line, at most once per interval, with throughput and ETA
//! - exactly one summary line when the total is reached

use indicatif::{HumanBytes, HumanDuration};
use parking_lot::Mutex;
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::store::TransferObserver;

/// The first periodic line shows up after at most this long, whatever the
/// configured interval.
const FIRST_REPORT_DELAY: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressReport {
    Periodic(String),
    Finished(String),
}

impl ProgressReport {
    pub fn line(&self) -> &str {
        match self {
            ProgressReport::Periodic(s) | ProgressReport::Finished(s) => s,
        }
    }
}

#[derive(Debug, Default)]
struct MeterState {
    count: u64,
    first_seen: Option<Instant>,
    last_report_at: Option<Instant>,
    last_report_count: u64,
    next_due: Option<Instant>,
    finished: bool,
}

pub struct ProgressMeter {
    label: String,
    total: u64,
    interval: Duration,
    state: Mutex<MeterState>,
}

impl ProgressMeter {
    pub fn new(label: impl Into<String>, total: u64, interval: Duration) -> Self {
        Self {
            label: label.into(),
            total,
            interval,
            state: Mutex::new(MeterState::default()),
        }
    }

    /// Short label for a long path: keeps the tail, which is where the
    /// logical id and part suffix live.
    pub fn label_for(path: &str) -> String {
        const KEEP: usize = 17;
        let chars: Vec<char> = path.chars().collect();
        if chars.len() <= KEEP {
            path.to_string()
        } else {
            let tail: String = chars[chars.len() - KEEP..].iter().collect();
            format!("...{tail}")
        }
    }

    pub fn update(&self, bytes: u64) -> Option<ProgressReport> {
        self.update_at(bytes, Instant::now())
    }

    pub fn update_at(&self, bytes: u64, now: Instant) -> Option<ProgressReport> {
        let mut st = self.state.lock();
        if st.finished {
            return None;
        }

        let first = *st.first_seen.get_or_insert(now);
        if st.last_report_at.is_none() {
            // the first chunk landed before we started the clock
            st.last_report_at = Some(now);
            st.last_report_count = bytes;
            st.next_due = Some(now + self.interval.min(FIRST_REPORT_DELAY));
        }
        st.count = st.count.saturating_add(bytes);

        let elapsed = now.saturating_duration_since(first);
        if st.count >= self.total {
            st.finished = true;
            return Some(ProgressReport::Finished(format!(
                "{} {} in ~{}",
                self.label,
                HumanBytes(self.total),
                HumanDuration(elapsed)
            )));
        }

        let due = st.next_due.map_or(true, |d| now >= d);
        if !due {
            return None;
        }

        let last_at = st.last_report_at.unwrap_or(first);
        let since_last = secs(now.saturating_duration_since(last_at));
        // Callbacks can arrive out of order, so this can come out zero or
        // negative; it is reported as is.
        let delta = st.count as f64 - st.last_report_count as f64;
        let rate = if since_last > 0.0 { delta / since_last } else { 0.0 };
        let average = if secs(elapsed) > 0.0 {
            st.count as f64 / secs(elapsed)
        } else {
            0.0
        };
        let percent = if self.total > 0 {
            st.count as f64 / self.total as f64 * 100.0
        } else {
            100.0
        };
        let eta = if rate > 0.0 {
            let remaining = (self.total - st.count) as f64 / rate;
            HumanDuration(Duration::from_secs_f64(remaining)).to_string()
        } else {
            "unknown".to_string()
        };

        let line = format!(
            "{:<20} {:<10} {:>10} / {} {:3.0}%  {} {}  ETA: {}",
            self.label,
            HumanDuration(elapsed).to_string(),
            HumanBytes(st.count).to_string(),
            HumanBytes(self.total),
            percent,
            format_rate(rate),
            format_rate(average),
            eta
        );

        st.last_report_at = Some(now);
        st.last_report_count = st.count;
        st.next_due = Some(now + self.interval);
        Some(ProgressReport::Periodic(line))
    }

    pub fn transferred(&self) -> u64 {
        self.state.lock().count
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }
}

fn secs(d: Duration) -> f64 {
    d.as_secs_f64()
}

fn format_rate(rate: f64) -> String {
    if rate.is_finite() && rate >= 0.0 {
        format!("{}/s", HumanBytes(rate as u64))
    } else {
        format!("{rate:.0} B/s")
    }
}

/// Adapts a [`ProgressMeter`] to the store's observer interface and writes the
/// reports to the log. Also lets a cancelled run abort the transfer between
/// chunks.
pub struct MeteredTransfer<'a> {
    meter: ProgressMeter,
    cancel: &'a CancelToken,
}

impl<'a> MeteredTransfer<'a> {
    pub fn new(meter: ProgressMeter, cancel: &'a CancelToken) -> Self {
        Self { meter, cancel }
    }
}

impl TransferObserver for MeteredTransfer<'_> {
    fn on_bytes(&self, bytes: u64) {
        match self.meter.update(bytes) {
            Some(ProgressReport::Finished(line)) => tracing::info!("{line}"),
            Some(ProgressReport::Periodic(line)) => tracing::info!("{line}"),
            None => {}
        }
    }

    fn should_abort(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
