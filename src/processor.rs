//! Drives the data source, invokes the mapping function per block, pushes
//! results into the writer, enforces flush at chain-head, detects reorgs,
//! and propagates failures to the program runner.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::StreamExt;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{CoreError, StoreError};
use crate::mapper::Mapper;
use crate::metrics::Metrics;
use crate::reconcile;
use crate::schema::{self, BLOCKS_TABLE};
use crate::source::{BlockRef, DataSource, HasHeader};
use crate::store::StoreAdapter;
use crate::writer::{BlockWriter, TableOptions};

/// The maximum number of blocks the reorg path will step back while probing
/// for a still-canonical ancestor before giving up.
const MAX_REORG_DEPTH: u64 = 1024;

/// Programmatic construction surface for a processing run. `item_defaults`
/// and `blocks_defaults` apply to every table that doesn't have a more
/// specific entry in `tables`; the per-table entries in `tables` are only
/// populated lazily once the schema is known (`blocks` may be set eagerly).
pub struct ProcessorArgs<B, S, M> {
    pub store_url: String,
    pub database: String,
    pub item_defaults: TableOptions,
    pub blocks_defaults: TableOptions,
    pub tables: BTreeMap<String, TableOptions>,
    pub source: S,
    pub map: M,
    _marker: PhantomData<fn() -> B>,
}

impl<B, S, M> ProcessorArgs<B, S, M> {
    pub fn new(store_url: impl Into<String>, database: impl Into<String>, source: S, map: M) -> Self {
        Self {
            store_url: store_url.into(),
            database: database.into(),
            item_defaults: TableOptions::item_defaults(),
            blocks_defaults: TableOptions::blocks_defaults(),
            tables: BTreeMap::new(),
            source,
            map,
            _marker: PhantomData,
        }
    }

    pub fn with_item_defaults(mut self, options: TableOptions) -> Self {
        self.item_defaults = options;
        self
    }

    pub fn with_blocks_defaults(mut self, options: TableOptions) -> Self {
        self.blocks_defaults = options;
        self
    }

    pub fn with_table_options(mut self, table: impl Into<String>, options: TableOptions) -> Self {
        self.tables.insert(table.into(), options);
        self
    }
}

#[derive(Debug, Deserialize)]
struct HeadRow {
    number: u64,
    hash: String,
}

#[derive(Debug, Deserialize)]
struct HashRow {
    hash: String,
}

async fn read_head(store: &StoreAdapter, database: &str) -> Result<Option<BlockRef>, StoreError> {
    let rows = store
        .query::<HeadRow>(database, &format!("SELECT number, hash FROM {BLOCKS_TABLE} ORDER BY number DESC LIMIT 1"))
        .await?
        .data;
    Ok(rows.into_iter().next().map(|r| BlockRef { number: r.number, hash: r.hash }))
}

async fn stored_hash_at(store: &StoreAdapter, database: &str, number: u64) -> Result<Option<String>, StoreError> {
    let rows = store
        .query::<HashRow>(database, &format!("SELECT hash FROM {BLOCKS_TABLE} WHERE number = {number}"))
        .await?
        .data;
    Ok(rows.into_iter().next().map(|r| r.hash))
}

/// Run the processing loop to completion: returns `Ok(())` on clean stream
/// termination or on `shutdown` resolving first, `Err` on any unrecovered
/// failure (after a best-effort final flush when the writer is still
/// healthy). Pass `std::future::pending()` for `shutdown` to run with no
/// external cancellation path.
pub async fn run<B, S, M>(
    args: ProcessorArgs<B, S, M>,
    shutdown: impl std::future::Future<Output = ()> + Send,
) -> Result<(), CoreError>
where
    B: HasHeader + Send + Sync + 'static,
    S: DataSource<B>,
    M: Mapper<B>,
{
    let store = Arc::new(StoreAdapter::new(args.store_url));

    let schema_info = schema::inspect(&store, &args.database).await?;
    info!(item_tables = ?schema_info.item_tables, "schema validated");

    let mut head = read_head(&store, &args.database).await?;
    reconcile::reconcile(&store, &args.database, &schema_info.item_tables, head.as_ref()).await?;

    let mut table_options: BTreeMap<String, TableOptions> = BTreeMap::new();
    for table in &schema_info.item_tables {
        table_options.insert(table.clone(), args.item_defaults);
    }
    table_options.insert(BLOCKS_TABLE.to_owned(), args.blocks_defaults);
    table_options.extend(args.tables.iter().map(|(k, v)| (k.clone(), *v)));

    let writer = BlockWriter::new(Arc::clone(&store), args.database.clone(), &schema_info, &table_options);
    let metrics = Metrics::new();

    tokio::pin!(shutdown);
    let result = drive(
        &args.source,
        &args.map,
        &writer,
        &store,
        &args.database,
        &schema_info.item_tables,
        &mut head,
        &metrics,
        shutdown,
    )
    .await;

    match result {
        Ok(()) => {
            writer.flush().await.map_err(CoreError::from)?;
            metrics.report_now();
            Ok(())
        }
        Err(err) => {
            if writer.is_healthy().await {
                if let Err(flush_err) = writer.flush().await {
                    warn!(error = %flush_err, "best-effort final flush also failed");
                }
            }
            Err(err)
        }
    }
}

async fn drive<B, S, M>(
    source: &S,
    mapper: &M,
    writer: &BlockWriter,
    store: &StoreAdapter,
    database: &str,
    item_tables: &[String],
    head: &mut Option<BlockRef>,
    metrics: &Metrics,
    mut shutdown: std::pin::Pin<&mut (impl std::future::Future<Output = ()> + Send)>,
) -> Result<(), CoreError>
where
    B: HasHeader + Send + Sync + 'static,
    S: DataSource<B>,
    M: Mapper<B>,
{
    let mut stream = source.create_data_stream(head.clone());

    loop {
        let batch = tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("shutdown requested, exiting after a best-effort final flush");
                return Ok(());
            }
            next = stream.next() => match next {
                None => return Ok(()),
                Some(Ok(batch)) => batch,
                Some(Err(e)) => return Err(CoreError::from(e)),
            },
        };

        if let Some(first) = batch.blocks.first() {
            if let Some(current_head) = head.as_ref() {
                if first.header().parent_hash != current_head.hash {
                    let new_head = reconcile_reorg(source, store, database, item_tables, writer, current_head).await?;
                    *head = Some(new_head.clone());
                    stream = source.create_data_stream(Some(new_head));
                    continue;
                }
            }
        }

        let reached_head = batch.reached_head();

        for block in &batch.blocks {
            let output = mapper.map(block).await.map_err(CoreError::from)?;
            let row_count: u64 = output.tables.values().map(|rows| rows.len() as u64).sum();
            writer.drain().await.map_err(CoreError::from)?;
            writer.push(block.header(), output).await.map_err(CoreError::from)?;
            *head = Some(block.header().block_ref());
            metrics.record_block(block.header().number, row_count);
        }

        if reached_head {
            writer.flush().await.map_err(CoreError::from)?;
        }
    }
}

/// Walk back from `current_head` looking for the highest block whose stored
/// hash still matches the data source's own record of the canonical chain at
/// that height, then reconcile item tables down to it.
async fn reconcile_reorg<B, S>(
    source: &S,
    store: &StoreAdapter,
    database: &str,
    item_tables: &[String],
    writer: &BlockWriter,
    current_head: &BlockRef,
) -> Result<BlockRef, CoreError>
where
    B: HasHeader + Send + Sync + 'static,
    S: DataSource<B>,
{
    writer.flush().await.map_err(CoreError::from)?;
    warn!(head = current_head.number, "reorg detected, walking back for a canonical ancestor");

    let mut candidate_number = current_head.number;
    let new_head = loop {
        if candidate_number == 0 {
            break BlockRef { number: 0, hash: String::new() };
        }
        candidate_number -= 1;

        let source_ancestor = source.ancestor(candidate_number).await.map_err(CoreError::from)?;
        let stored = stored_hash_at(store, database, candidate_number).await.map_err(CoreError::from)?;

        match (source_ancestor, stored) {
            (Some(source_ref), Some(stored_hash)) if source_ref.hash == stored_hash => break source_ref,
            _ => {
                if current_head.number - candidate_number >= MAX_REORG_DEPTH {
                    return Err(CoreError::UnresolvedReorg { probed_depth: MAX_REORG_DEPTH });
                }
            }
        }
    };

    reconcile::reconcile(store, database, item_tables, Some(&new_head)).await.map_err(CoreError::from)?;
    info!(new_head = new_head.number, "reconciled to new head after reorg");
    Ok(new_head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::{Erc20Mapper, SyntheticSource};
    use mockito::Matcher;

    const COLUMNS_BODY: &str = "\
{\"table\":\"blocks\",\"name\":\"number\",\"type\":\"UInt64\"}
{\"table\":\"blocks\",\"name\":\"hash\",\"type\":\"String\"}
{\"table\":\"blocks\",\"name\":\"parent_hash\",\"type\":\"String\"}
{\"table\":\"transfers\",\"name\":\"block_number\",\"type\":\"UInt64\"}
{\"table\":\"transfers\",\"name\":\"block_hash\",\"type\":\"String\"}
";

    #[tokio::test]
    async fn runs_a_small_synthetic_pipeline_to_completion() {
        let mut server = mockito::Server::new_async().await;

        let _columns = server
            .mock("POST", "/")
            .match_body(Matcher::Regex("system.columns".to_string()))
            .with_status(200)
            .with_body(COLUMNS_BODY)
            .create_async()
            .await;

        let _head = server
            .mock("POST", "/")
            .match_body(Matcher::Regex("FROM blocks ORDER BY".to_string()))
            .with_status(200)
            .with_body("")
            .create_async()
            .await;

        let _reconcile = server
            .mock("POST", "/")
            .match_body(Matcher::Regex("ALTER TABLE".to_string()))
            .with_status(200)
            .with_body("")
            .create_async()
            .await;

        let _inserts = server
            .mock("POST", "/")
            .match_query(Matcher::Regex("query=INSERT".to_string()))
            .with_status(200)
            .with_body("")
            .create_async()
            .await;

        let args = ProcessorArgs::new(server.url(), "db", SyntheticSource::new(5, 2), Erc20Mapper)
            .with_item_defaults(TableOptions { low_watermark: 1, high_watermark: 100 })
            .with_blocks_defaults(TableOptions { low_watermark: 1, high_watermark: 100 });

        run(args, std::future::pending()).await.unwrap();
    }
}
