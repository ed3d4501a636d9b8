//! Throughput reporting: a rolling blocks/rows-per-second tracker that logs a
//! status line via `tracing` at most once every five seconds while blocks are
//! flowing, and at least once every five seconds (a timer-driven line with
//! zero throughput) when they are not.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::info;

const REPORT_INTERVAL: Duration = Duration::from_secs(5);

struct Sample {
    blocks: u64,
    rows: u64,
}

struct State {
    window_start: Instant,
    last_report: Instant,
    current: Sample,
    head_number: Option<u64>,
}

pub struct Metrics {
    state: Mutex<State>,
}

impl Metrics {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            state: Mutex::new(State {
                window_start: now,
                last_report: now,
                current: Sample { blocks: 0, rows: 0 },
                head_number: None,
            }),
        }
    }

    /// Record one processed block and the row count its mapping produced.
    pub fn record_block(&self, block_number: u64, row_count: u64) {
        let mut state = self.state.lock().expect("metrics mutex poisoned");
        state.current.blocks += 1;
        state.current.rows += row_count;
        state.head_number = Some(block_number);
        drop(state);
        self.maybe_report();
    }

    /// Log a throughput line if at least [`REPORT_INTERVAL`] has elapsed
    /// since the last one, resetting the rolling window.
    pub fn maybe_report(&self) {
        let mut state = self.state.lock().expect("metrics mutex poisoned");
        if state.last_report.elapsed() < REPORT_INTERVAL {
            return;
        }
        Self::emit(&state);
        state.window_start = Instant::now();
        state.last_report = state.window_start;
        state.current = Sample { blocks: 0, rows: 0 };
    }

    /// Force a report line regardless of elapsed time; used once at shutdown
    /// so the final partial window is not silently dropped.
    pub fn report_now(&self) {
        let state = self.state.lock().expect("metrics mutex poisoned");
        Self::emit(&state);
    }

    fn emit(state: &State) {
        let elapsed = state.window_start.elapsed().as_secs_f64().max(0.001);
        let blocks_per_sec = state.current.blocks as f64 / elapsed;
        let rows_per_sec = state.current.rows as f64 / elapsed;
        info!(
            head = ?state.head_number,
            blocks_per_sec = format_args!("{blocks_per_sec:.2}"),
            rows_per_sec = format_args!("{rows_per_sec:.2}"),
            "throughput"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_block_tracks_the_latest_head_without_reporting_early() {
        let metrics = Metrics::new();
        metrics.record_block(1, 3);
        metrics.record_block(2, 5);

        let state = metrics.state.lock().unwrap();
        assert_eq!(state.head_number, Some(2));
        assert_eq!(state.current.blocks, 2);
        assert_eq!(state.current.rows, 8);
    }

    #[test]
    fn report_now_does_not_panic_on_a_fresh_tracker() {
        let metrics = Metrics::new();
        metrics.report_now();
    }
}
