//! The per-table buffered insert engine: watermarks, backpressure, parallel
//! per-table flushes, and the `blocks`-table commit barrier.

mod buffer;

pub use buffer::TableOptions;
use buffer::TableBuffer;

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::json;
use tokio::sync::Notify;
use tracing::error;

use crate::error::{FlushError, MapError};
use crate::schema::{OptionalColumns, SchemaInfo};
use crate::source::{BlockHeader, PerBlockOutput, TableRow};
use crate::store::StoreAdapter;

/// A row tagged with the block it was produced for. `hash`/`timestamp` are
/// carried alongside the number so a flush can populate the optional
/// `block_hash`/`block_timestamp` columns without re-deriving them.
#[derive(Clone)]
struct RowTag {
    number: u64,
    hash: String,
    timestamp: Option<u64>,
}

#[derive(Clone)]
struct ItemRow {
    tag: RowTag,
    row: TableRow,
}

fn item_row_number(r: &ItemRow) -> u64 {
    r.tag.number
}

fn block_row_number(h: &BlockHeader) -> u64 {
    h.number
}

pub struct BlockWriter {
    store: Arc<StoreAdapter>,
    database: String,
    optional_columns: BTreeMap<String, OptionalColumns>,
    item_buffers: BTreeMap<String, Arc<TableBuffer<ItemRow>>>,
    blocks_buffer: Arc<TableBuffer<BlockHeader>>,
    notify: Arc<Notify>,
}

impl BlockWriter {
    pub fn new(
        store: Arc<StoreAdapter>,
        database: impl Into<String>,
        schema: &SchemaInfo,
        overrides: &BTreeMap<String, TableOptions>,
    ) -> Self {
        let item_buffers = schema
            .item_tables
            .iter()
            .map(|table| {
                let opts = overrides.get(table).copied().unwrap_or_else(TableOptions::item_defaults);
                (table.clone(), Arc::new(TableBuffer::new(table.clone(), opts, item_row_number)))
            })
            .collect();

        let blocks_opts = overrides
            .get(crate::schema::BLOCKS_TABLE)
            .copied()
            .unwrap_or_else(TableOptions::blocks_defaults);

        Self {
            store,
            database: database.into(),
            optional_columns: schema.optional_columns.clone(),
            item_buffers,
            blocks_buffer: Arc::new(TableBuffer::new(
                crate::schema::BLOCKS_TABLE,
                blocks_opts,
                block_row_number,
            )),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn item_table_names(&self) -> impl Iterator<Item = &str> {
        self.item_buffers.keys().map(String::as_str)
    }

    /// Append one block's mapping output to the per-table buffers, plus one
    /// row to the `blocks` buffer. Bookkeeping-only; the actual flush work is
    /// kicked off in background tasks that this call does not wait on.
    pub async fn push(&self, header: &BlockHeader, output: PerBlockOutput) -> Result<(), MapError> {
        for table in output.tables.keys() {
            if !self.item_buffers.contains_key(table) {
                return Err(MapError::UnknownTable { table: table.clone() });
            }
        }

        let tag = RowTag { number: header.number, hash: header.hash.clone(), timestamp: header.timestamp };
        let mut output = output;

        for (table, buffer) in &self.item_buffers {
            let buffer = Arc::clone(buffer);
            if let Some(rows) = output.tables.remove(table) {
                let tagged = rows.into_iter().map(|row| ItemRow { tag: tag.clone(), row });
                buffer.push(tagged).await;
            }
            buffer.mark_seen(header.number).await;
            self.spawn_item_flush_if_due(buffer, false).await;
        }

        self.blocks_buffer.push(std::iter::once(header.clone())).await;
        self.spawn_blocks_flush_if_due(false).await;

        Ok(())
    }

    /// Suspend until every table's pending row count is at or below its high
    /// watermark, surfacing any flush error recorded in the meantime.
    pub async fn drain(&self) -> Result<(), FlushError> {
        loop {
            // `enable()` registers this `Notified` as a waiter immediately,
            // before the condition checks below run. `notify_waiters()`
            // wakes only already-registered waiters and stores no permit,
            // so without this a flush task's notification landing in the gap
            // between creating `notified` and awaiting it would be lost.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(err) = self.first_error().await {
                return Err(err);
            }
            if self.all_below_high_watermark().await {
                return Ok(());
            }
            notified.await;
        }
    }

    /// Force-flush every non-empty buffer (ignoring low watermarks) and wait
    /// for all in-flight and newly started flushes to complete.
    pub async fn flush(&self) -> Result<(), FlushError> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let mut started_or_running = false;

            for buffer in self.item_buffers.values() {
                if self.spawn_item_flush_if_due(Arc::clone(buffer), true).await || buffer.is_flushing().await {
                    started_or_running = true;
                }
            }
            if self.spawn_blocks_flush_if_due(true).await || self.blocks_buffer.is_flushing().await {
                started_or_running = true;
            }

            if let Some(err) = self.first_error().await {
                return Err(err);
            }

            let item_rows_left = {
                let mut total = 0;
                for buffer in self.item_buffers.values() {
                    total += buffer.pending_count().await;
                }
                total
            };
            let blocks_rows_left = self.blocks_buffer.pending_count().await;

            if !started_or_running && item_rows_left == 0 && blocks_rows_left == 0 {
                return Ok(());
            }

            notified.await;
        }
    }

    pub async fn is_healthy(&self) -> bool {
        for buffer in self.item_buffers.values() {
            if buffer.has_error().await {
                return false;
            }
        }
        !self.blocks_buffer.has_error().await
    }

    async fn all_below_high_watermark(&self) -> bool {
        for buffer in self.item_buffers.values() {
            if buffer.pending_count().await as u32 > buffer.high_watermark() {
                return false;
            }
        }
        self.blocks_buffer.pending_count().await as u32 <= self.blocks_buffer.high_watermark()
    }

    async fn first_error(&self) -> Option<FlushError> {
        for buffer in self.item_buffers.values() {
            if let Some(err) = buffer.take_error().await {
                return Some(err);
            }
        }
        self.blocks_buffer.take_error().await
    }

    /// Start a background flush of `buffer` if its watermark condition (or
    /// `force`) says it's due. Returns whether a flush was started.
    async fn spawn_item_flush_if_due(&self, buffer: Arc<TableBuffer<ItemRow>>, force: bool) -> bool {
        if !buffer.should_flush(force).await {
            return false;
        }

        let store = Arc::clone(&self.store);
        let database = self.database.clone();
        let notify = Arc::clone(&self.notify);
        let opts = self.optional_columns.get(&buffer.name).copied().unwrap_or_default();

        tokio::spawn(async move {
            let rows = buffer.begin_flush(None).await;
            if rows.is_empty() {
                return;
            }
            let body = serialize_item_rows(&rows, opts);
            match store.insert(&database, &buffer.name, once_stream(body)).await {
                Ok(()) => buffer.complete_flush(&rows).await,
                Err(e) => {
                    error!(table = %buffer.name, error = %e, "item table flush failed");
                    buffer.fail_flush(FlushError { table: buffer.name.clone(), source: e }).await;
                }
            }
            notify.notify_waiters();
        });
        true
    }

    /// Start a background flush of the `blocks` buffer, shipping only the
    /// prefix of rows whose block number is at or below every item table's
    /// durable ceiling (the commit barrier).
    async fn spawn_blocks_flush_if_due(&self, force: bool) -> bool {
        if !self.blocks_buffer.should_flush(force).await {
            return false;
        }

        let buffer = Arc::clone(&self.blocks_buffer);
        let store = Arc::clone(&self.store);
        let database = self.database.clone();
        let notify = Arc::clone(&self.notify);
        let item_buffers = self.item_buffers.clone();

        tokio::spawn(async move {
            let ceiling: Option<u64> = if item_buffers.is_empty() {
                None
            } else {
                let mut min_durable: Option<u64> = Some(u64::MAX);
                for b in item_buffers.values() {
                    match b.durable_up_to().await {
                        None => {
                            min_durable = None;
                            break;
                        }
                        Some(d) => min_durable = min_durable.map(|m| m.min(d)),
                    }
                }
                min_durable
            };

            let all_pending = buffer.begin_flush(None).await;
            if all_pending.is_empty() {
                return;
            }

            let eligible: Vec<_> = if item_buffers.is_empty() {
                all_pending
            } else {
                match ceiling {
                    None => Vec::new(),
                    Some(ceiling) => all_pending.into_iter().take_while(|h| h.number <= ceiling).collect(),
                }
            };

            if eligible.is_empty() {
                // Nothing publishable yet (commit barrier not satisfied);
                // release the in-flight marker with a no-op completion so a
                // later push/flush can retry once more rows are durable.
                buffer.complete_flush(&[]).await;
            } else {
                let body = serialize_block_rows(&eligible);
                match store.insert(&database, crate::schema::BLOCKS_TABLE, once_stream(body)).await {
                    Ok(()) => buffer.complete_flush(&eligible).await,
                    Err(e) => {
                        error!(error = %e, "blocks table flush failed");
                        buffer
                            .fail_flush(FlushError { table: crate::schema::BLOCKS_TABLE.to_owned(), source: e })
                            .await;
                    }
                }
            }
            notify.notify_waiters();
        });
        true
    }
}

fn serialize_item_rows(rows: &[ItemRow], opts: OptionalColumns) -> Bytes {
    let mut out = String::new();
    for r in rows {
        let mut obj = r.row.clone();
        obj.insert("block_number".to_owned(), json!(r.tag.number));
        if opts.block_hash {
            obj.insert("block_hash".to_owned(), json!(r.tag.hash));
        }
        if opts.block_timestamp {
            if let Some(ts) = r.tag.timestamp {
                obj.insert("block_timestamp".to_owned(), json!(ts));
            }
        }
        out.push_str(&serde_json::Value::Object(obj).to_string());
        out.push('\n');
    }
    Bytes::from(out)
}

fn serialize_block_rows(rows: &[BlockHeader]) -> Bytes {
    let mut out = String::new();
    for h in rows {
        let mut obj = serde_json::Map::new();
        obj.insert("number".to_owned(), json!(h.number));
        obj.insert("hash".to_owned(), json!(h.hash));
        obj.insert("parent_hash".to_owned(), json!(h.parent_hash));
        if let Some(pn) = h.parent_number {
            obj.insert("parent_number".to_owned(), json!(pn));
        }
        if let Some(ts) = h.timestamp {
            obj.insert("timestamp".to_owned(), json!(ts));
        }
        out.push_str(&serde_json::Value::Object(obj).to_string());
        out.push('\n');
    }
    Bytes::from(out)
}

fn once_stream(body: Bytes) -> impl futures::Stream<Item = Result<Bytes, std::io::Error>> + Send + Sync + 'static {
    futures::stream::once(async move { Ok(body) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{OptionalColumns, SchemaInfo};
    use mockito::Matcher;

    fn header(number: u64) -> BlockHeader {
        BlockHeader {
            number,
            hash: format!("h{number}"),
            parent_hash: if number == 0 { String::new() } else { format!("h{}", number - 1) },
            parent_number: number.checked_sub(1),
            timestamp: Some(1_000 + number),
        }
    }

    fn schema_with(item_tables: &[&str]) -> SchemaInfo {
        SchemaInfo {
            item_tables: item_tables.iter().map(|s| s.to_string()).collect(),
            optional_columns: item_tables
                .iter()
                .map(|s| (s.to_string(), OptionalColumns { block_hash: true, block_timestamp: true }))
                .collect(),
        }
    }

    #[tokio::test]
    async fn blocks_row_withheld_until_item_table_is_durable() {
        let mut server = mockito::Server::new_async().await;

        let item_mock = server
            .mock("POST", "/")
            .match_query(Matcher::Regex("INTO.{1,3}a.{1,3}FORMAT".to_string()))
            .with_status(200)
            .with_body("")
            .expect(1)
            .create_async()
            .await;

        let blocks_mock = server
            .mock("POST", "/")
            .match_query(Matcher::Regex("INTO.{1,3}blocks.{1,3}FORMAT".to_string()))
            .with_status(200)
            .with_body("")
            .expect(1)
            .create_async()
            .await;

        let store = Arc::new(StoreAdapter::new(server.url()));
        let schema = schema_with(&["a"]);

        let mut overrides = BTreeMap::new();
        overrides.insert("a".to_owned(), TableOptions { low_watermark: 1000, high_watermark: 10_000 });
        overrides.insert(crate::schema::BLOCKS_TABLE.to_owned(), TableOptions { low_watermark: 1, high_watermark: 10 });

        let writer = BlockWriter::new(store, "db".to_owned(), &schema, &overrides);

        let mut output = PerBlockOutput::new();
        let mut row = serde_json::Map::new();
        row.insert("value".to_owned(), json!(1));
        output.push("a", row);

        writer.push(&header(1), output).await.unwrap();

        // Table "a" is below its (deliberately high) low watermark, so it
        // never auto-flushes and has no durable_up_to yet; the first
        // blocks-buffer flush attempt (triggered by blocks' low watermark of
        // 1) should find the barrier unsatisfied and release without
        // shipping. `flush()` then force-flushes everything, including "a",
        // which unblocks the barrier and lets the blocks row ship too.
        writer.flush().await.unwrap();

        item_mock.assert_async().await;
        blocks_mock.assert_async().await;
    }

    #[tokio::test]
    async fn unknown_table_in_mapper_output_is_rejected() {
        let store = Arc::new(StoreAdapter::new("http://127.0.0.1:1".to_owned()));
        let schema = schema_with(&["a"]);
        let writer = BlockWriter::new(store, "db".to_owned(), &schema, &BTreeMap::new());

        let mut output = PerBlockOutput::new();
        output.push("nonexistent", serde_json::Map::new());

        let err = writer.push(&header(1), output).await.unwrap_err();
        assert!(matches!(err, MapError::UnknownTable { table } if table == "nonexistent"));
    }
}
