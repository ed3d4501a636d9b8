//! A generic blockchain-ETL core: read blocks from a `DataSource`, map each
//! one to a set of table rows via a `Mapper`, and land them durably in a
//! ClickHouse-shaped columnar store behind watermarked, reorg-tolerant
//! buffering.
//!
//! Everything this crate does is generic over the block type `B` and the
//! `DataSource<B>`/`Mapper<B>` pair a caller supplies; see `demos/` for a
//! minimal end-to-end pipeline.

pub mod config;
pub mod demo;
pub mod error;
pub mod mapper;
pub mod metrics;
pub mod processor;
pub mod reconcile;
pub mod runner;
pub mod schema;
pub mod source;
pub mod store;
pub mod writer;

pub use error::{CoreError, FlushError, MapError, SchemaError, SourceError, StoreError};
pub use mapper::{FnMapper, Mapper as MapperTrait};
pub use processor::ProcessorArgs;
pub use runner::run_program;
pub use schema::SchemaInfo;
pub use source::{BlockHeader, BlockRef, DataBatch, DataSource, HasHeader, PerBlockOutput, TableRow};
pub use writer::{BlockWriter, TableOptions};
