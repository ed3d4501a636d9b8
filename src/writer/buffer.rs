//! A single table's in-memory row queue plus its watermark/flush state.
//!
//! One [`TableBuffer`] instance backs each item table and one backs the
//! `blocks` table. Flushing is driven externally (by [`super::BlockWriter`])
//! so that the `blocks` buffer's commit-barrier logic, "only ship the
//! prefix of rows whose block number is already durable in every item
//! table", can live one level up without this type knowing about its
//! siblings.

use std::collections::VecDeque;

use tokio::sync::Mutex;

use crate::error::FlushError;

/// Per-table watermark configuration.
#[derive(Debug, Clone, Copy)]
pub struct TableOptions {
    pub low_watermark: u32,
    pub high_watermark: u32,
}

impl TableOptions {
    pub const fn item_defaults() -> Self {
        Self { low_watermark: 8192, high_watermark: 32768 }
    }

    pub const fn blocks_defaults() -> Self {
        Self { low_watermark: 1024, high_watermark: 4096 }
    }
}

struct BufferState<R> {
    rows: VecDeque<R>,
    in_flight: bool,
    durable_up_to: Option<u64>,
    error: Option<FlushError>,
}

/// Buffers rows of type `R` for one table. `number_of` extracts the block
/// number a row belongs to, which is all the generic flush bookkeeping needs
/// to know about a row's shape; see [`crate::writer::ItemRow`] and
/// [`crate::source::BlockHeader`] for the two instantiations this crate uses.
pub struct TableBuffer<R> {
    pub name: String,
    pub options: TableOptions,
    number_of: fn(&R) -> u64,
    state: Mutex<BufferState<R>>,
}

impl<R> TableBuffer<R> {
    pub fn new(name: impl Into<String>, options: TableOptions, number_of: fn(&R) -> u64) -> Self {
        Self {
            name: name.into(),
            options,
            number_of,
            state: Mutex::new(BufferState {
                rows: VecDeque::new(),
                in_flight: false,
                durable_up_to: None,
                error: None,
            }),
        }
    }

    pub async fn push(&self, rows: impl IntoIterator<Item = R>) {
        let mut state = self.state.lock().await;
        state.rows.extend(rows);
    }

    /// Record that the writer has considered this table through `number`,
    /// whether or not any rows were pushed for it. If the buffer currently
    /// has nothing pending, it is therefore already durable up to `number`.
    /// This is what lets the `blocks` commit barrier clear a table that
    /// legitimately never receives rows for some (or all) blocks, instead of
    /// waiting forever for a flush that will never happen.
    pub async fn mark_seen(&self, number: u64) {
        let mut state = self.state.lock().await;
        if state.rows.is_empty() {
            state.durable_up_to = Some(state.durable_up_to.map_or(number, |prev| prev.max(number)));
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.rows.len()
    }

    pub async fn durable_up_to(&self) -> Option<u64> {
        self.state.lock().await.durable_up_to
    }

    pub async fn has_error(&self) -> bool {
        self.state.lock().await.error.is_some()
    }

    pub async fn take_error(&self) -> Option<FlushError> {
        self.state.lock().await.error.take()
    }

    /// Whether a background flush is worth starting: no flush currently in
    /// flight, and either `force` (head-of-chain / explicit `flush()`) or the
    /// low watermark has been crossed.
    pub async fn should_flush(&self, force: bool) -> bool {
        let state = self.state.lock().await;
        if state.in_flight || state.rows.is_empty() {
            return false;
        }
        force || state.rows.len() as u32 >= self.options.low_watermark
    }

    pub async fn is_flushing(&self) -> bool {
        self.state.lock().await.in_flight
    }

    /// Snapshot up to `limit` rows (in FIFO order) for a flush attempt,
    /// claiming the in-flight flag atomically with the snapshot. `limit =
    /// None` takes every currently pending row. Returns an empty vec (and
    /// leaves the in-flight flag untouched) if a flush is already in flight
    /// or there is nothing eligible to ship, so two flush attempts racing
    /// between `should_flush` and `begin_flush` can never both snapshot and
    /// ship the same rows.
    pub async fn begin_flush(&self, limit: Option<usize>) -> Vec<R>
    where
        R: Clone,
    {
        let mut state = self.state.lock().await;
        if state.in_flight {
            return Vec::new();
        }
        let n = limit.unwrap_or(state.rows.len()).min(state.rows.len());
        if n == 0 {
            return Vec::new();
        }
        state.in_flight = true;
        state.rows.iter().take(n).cloned().collect()
    }

    /// Mark a flush of `shipped` rows (the prefix [`begin_flush`] returned)
    /// as durable, removing them from the front of the queue and advancing
    /// `durable_up_to`.
    pub async fn complete_flush(&self, shipped: &[R]) {
        let mut state = self.state.lock().await;
        for _ in 0..shipped.len() {
            state.rows.pop_front();
        }
        if let Some(max) = shipped.iter().map(self.number_of).max() {
            state.durable_up_to = Some(state.durable_up_to.map_or(max, |prev| prev.max(max)));
        }
        state.in_flight = false;
    }

    pub async fn fail_flush(&self, error: FlushError) {
        let mut state = self.state.lock().await;
        state.in_flight = false;
        state.error = Some(error);
    }

    pub fn high_watermark(&self) -> u32 {
        self.options.high_watermark
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(low: u32, high: u32) -> TableOptions {
        TableOptions { low_watermark: low, high_watermark: high }
    }

    #[tokio::test]
    async fn should_flush_respects_low_watermark_and_in_flight() {
        let buf = TableBuffer::new("t", opts(2, 10), |n: &u64| *n);
        assert!(!buf.should_flush(false).await);

        buf.push([1u64]).await;
        assert!(!buf.should_flush(false).await, "below low watermark");

        buf.push([2u64]).await;
        assert!(buf.should_flush(false).await, "at low watermark");

        let rows = buf.begin_flush(None).await;
        assert_eq!(rows, vec![1, 2]);
        assert!(!buf.should_flush(false).await, "flush already in flight");
        assert!(!buf.should_flush(true).await, "force still blocked by in-flight");
    }

    #[tokio::test]
    async fn complete_flush_advances_durable_up_to_and_pops_rows() {
        let buf = TableBuffer::new("t", opts(1, 10), |n: &u64| *n);
        buf.push([5u64, 6, 7]).await;
        let rows = buf.begin_flush(Some(2)).await;
        assert_eq!(rows, vec![5, 6]);
        buf.complete_flush(&rows).await;

        assert_eq!(buf.durable_up_to().await, Some(6));
        assert_eq!(buf.pending_count().await, 1);
        assert!(!buf.is_flushing().await);
    }

    #[tokio::test]
    async fn mark_seen_only_advances_durable_up_to_when_empty() {
        let buf = TableBuffer::new("t", opts(1, 10), |n: &u64| *n);
        buf.mark_seen(3).await;
        assert_eq!(buf.durable_up_to().await, Some(3));

        buf.push([10u64]).await;
        buf.mark_seen(11).await;
        assert_eq!(buf.durable_up_to().await, Some(3), "buffer has pending rows, unaffected");
    }

    #[tokio::test]
    async fn begin_flush_is_a_no_op_while_one_is_already_in_flight() {
        let buf = TableBuffer::new("t", opts(1, 10), |n: &u64| *n);
        buf.push([1u64, 2]).await;

        let first = buf.begin_flush(None).await;
        assert_eq!(first, vec![1, 2]);

        let second = buf.begin_flush(None).await;
        assert!(second.is_empty(), "a second snapshot must not ship rows already claimed by the first");

        buf.complete_flush(&first).await;
        assert_eq!(buf.pending_count().await, 0, "rows popped exactly once");
    }

    #[tokio::test]
    async fn fail_flush_records_error_and_clears_in_flight() {
        let buf = TableBuffer::new("t", opts(1, 10), |n: &u64| *n);
        buf.push([1u64]).await;
        let rows = buf.begin_flush(None).await;
        assert_eq!(rows.len(), 1);

        buf.fail_flush(FlushError {
            table: "t".to_owned(),
            source: crate::error::StoreError::Server { status: 500, message: "boom".to_owned() },
        })
        .await;

        assert!(!buf.is_flushing().await);
        assert!(buf.has_error().await);
        assert!(buf.take_error().await.is_some());
        assert!(!buf.has_error().await, "error taken, not re-readable");
    }
}
