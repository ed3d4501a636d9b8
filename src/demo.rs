//! A synthetic, deterministic chain used by `demos/erc20_transfers.rs` (and,
//! for lack of any real chain client in this repo, by the `chainsink` binary
//! itself) to exercise `DataSource`/`Mapper` end to end without any external
//! infrastructure. Not a template for a real integration.

use async_trait::async_trait;
use serde_json::json;

use crate::error::{MapError, SourceError};
use crate::mapper::Mapper;
use crate::source::{BlockHeader, BoxStream, DataBatch, HasHeader, PerBlockOutput, BlockRef, DataSource};

pub const TRANSFERS_TABLE: &str = "transfers";

fn synthetic_hash(number: u64) -> String {
    format!("0x{number:064x}")
}

/// A demo "block": a header plus how many synthetic transfers to emit.
#[derive(Debug, Clone)]
pub struct DemoBlock {
    header: BlockHeader,
    transfer_count: u32,
}

impl HasHeader for DemoBlock {
    fn header(&self) -> &BlockHeader {
        &self.header
    }
}

fn make_block(number: u64, transfer_count: u32) -> DemoBlock {
    let header = BlockHeader {
        number,
        hash: synthetic_hash(number),
        parent_hash: if number == 0 { String::new() } else { synthetic_hash(number - 1) },
        parent_number: number.checked_sub(1),
        timestamp: Some(1_700_000_000 + number * 12),
    };
    DemoBlock { header, transfer_count }
}

/// Emits a finite, deterministic run of blocks in fixed-size batches, each
/// with a handful of synthetic transfers. Never reorgs: `ancestor` always
/// returns the canonical synthetic hash for the requested height.
pub struct SyntheticSource {
    pub block_count: u64,
    pub batch_size: u64,
}

impl SyntheticSource {
    pub fn new(block_count: u64, batch_size: u64) -> Self {
        Self { block_count, batch_size }
    }
}

#[async_trait]
impl DataSource<DemoBlock> for SyntheticSource {
    fn create_data_stream(&self, after_block: Option<BlockRef>) -> BoxStream<DataBatch<DemoBlock>> {
        let start = after_block.map(|b| b.number + 1).unwrap_or(0);
        let total = self.block_count;
        let batch_size = self.batch_size.max(1);

        Box::pin(async_stream::try_stream! {
            let mut next = start;
            while next < total {
                let end = (next + batch_size).min(total);
                let blocks: Vec<DemoBlock> = (next..end)
                    .map(|n| make_block(n, (n % 3) as u32 + 1))
                    .collect();
                next = end;
                let head_number = Some(total - 1);
                yield DataBatch { blocks, head_number };
            }
        })
    }

    async fn ancestor(&self, number: u64) -> Result<Option<BlockRef>, SourceError> {
        if number >= self.block_count {
            return Ok(None);
        }
        Ok(Some(BlockRef { number, hash: synthetic_hash(number) }))
    }
}

/// Maps each demo block to `transfer_count` synthetic ERC-20-shaped rows in
/// the `transfers` table.
pub struct Erc20Mapper;

#[async_trait]
impl Mapper<DemoBlock> for Erc20Mapper {
    async fn map(&self, block: &DemoBlock) -> Result<PerBlockOutput, MapError> {
        let mut output = PerBlockOutput::new();
        for i in 0..block.transfer_count {
            let mut row = serde_json::Map::new();
            row.insert("log_index".to_owned(), json!(i));
            row.insert("from".to_owned(), json!(format!("0x{:040x}", block.header.number)));
            row.insert("to".to_owned(), json!(format!("0x{:040x}", block.header.number + 1)));
            row.insert("value".to_owned(), json!((i as u64 + 1) * 1_000_000_000_000_000_000));
            output.push(TRANSFERS_TABLE, row);
        }
        Ok(output)
    }
}
