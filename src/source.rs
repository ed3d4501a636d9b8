//! The data model shared across components, and the `DataSource` contract
//! the processing loop consumes.

use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::SourceError;

/// Identifies a block; used as the resume cursor and as the head marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRef {
    pub number: u64,
    pub hash: String,
}

/// The header fields the core cares about. Domain-specific payload (logs,
/// state diffs, instructions) lives in the generic `B` type and is opaque to
/// the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    pub parent_number: Option<u64>,
    pub timestamp: Option<u64>,
}

impl BlockHeader {
    pub fn block_ref(&self) -> BlockRef {
        BlockRef { number: self.number, hash: self.hash.clone() }
    }
}

/// Anything the mapping function can be called with must expose a header.
pub trait HasHeader {
    fn header(&self) -> &BlockHeader;
}

/// One cell in a JSON-each-row line: a mapping from column name to value.
pub type TableRow = serde_json::Map<String, serde_json::Value>;

/// Mapping-function output for a single block: table name -> row set.
#[derive(Debug, Default)]
pub struct PerBlockOutput {
    pub tables: BTreeMap<String, Vec<TableRow>>,
}

impl PerBlockOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, table: impl Into<String>, row: TableRow) {
        self.tables.entry(table.into()).or_default().push(row);
    }
}

/// A batch of blocks yielded by a `DataSource`, plus the source's best
/// estimate of the current chain tip.
#[derive(Debug)]
pub struct DataBatch<B> {
    pub blocks: Vec<B>,
    pub head_number: Option<u64>,
}

impl<B> DataBatch<B> {
    /// Whether this batch means "the source believes it has reached the
    /// chain head" per §4.5: empty batch, or `head_number` at or below the
    /// last emitted block.
    pub fn reached_head(&self) -> bool
    where
        B: HasHeader,
    {
        match self.blocks.last() {
            None => true,
            Some(last) => match self.head_number {
                None => true,
                Some(head) => head <= last.header().number,
            },
        }
    }
}

pub type BoxStream<T> = Pin<Box<dyn Stream<Item = Result<T, SourceError>> + Send>>;


/// The abstract, restartable, paged data source the processing loop drives.
/// Transport, reconnection and block decoding are external collaborators;
/// this trait is the only surface the core depends on.
#[async_trait]
pub trait DataSource<B>: Send + Sync
where
    B: HasHeader + Send + Sync + 'static,
{
    /// Start (or restart) an infinite-unless-ended stream of batches,
    /// resuming after `after_block` if given.
    fn create_data_stream(&self, after_block: Option<BlockRef>) -> BoxStream<DataBatch<B>>;

    /// Probe the canonical chain for the block at `number`, used only by the
    /// reorg path while walking back to find a still-canonical ancestor.
    /// Sources that only ever emit finalized blocks may return `Ok(None)`
    /// unconditionally; the reorg path is then simply never exercised.
    async fn ancestor(&self, number: u64) -> Result<Option<BlockRef>, SourceError>;
}
