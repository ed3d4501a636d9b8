use thiserror::Error;

/// The error taxonomy the core engine can raise. Every fallible operation in
/// `store`, `schema`, `reconcile`, `writer` and `processor` resolves to one of
/// these variants so that the program runner can log a single, typed fatal.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("map error: {0}")]
    Map(#[from] MapError),

    #[error("flush error: {0}")]
    Flush(#[from] FlushError),

    #[error("reorg deeper than {probed_depth} blocks: no canonical ancestor found at or above block 0")]
    UnresolvedReorg { probed_depth: u64 },
}

/// Raised by the schema inspector when the target database does not satisfy
/// the framework's column contract. Fatal at startup.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("'blocks' table is not defined in database '{database}'")]
    MissingBlocksTable { database: String },

    #[error("table '{table}' is missing required column '{column}'")]
    MissingColumn { table: String, column: String },

    #[error(
        "table '{table}' column '{column}' has type '{found}', expected {expected}"
    )]
    WrongColumnType {
        table: String,
        column: String,
        found: String,
        expected: &'static str,
    },

    #[error("table named 'blocks' cannot also be registered as an item table")]
    ReservedTableName,

    #[error("failed to read schema from store: {0}")]
    Store(#[from] StoreError),
}

/// Raised by the store adapter on a transport or server-side failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("store returned HTTP {status}: {message}")]
    Server { status: u16, message: String },

    #[error("failed to decode store response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Raised by a `DataSource` implementation.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("data source error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Raised by the user-supplied per-block mapping function.
#[derive(Debug, Error)]
pub enum MapError {
    #[error("mapping produced rows for unknown table '{table}'")]
    UnknownTable { table: String },

    #[error("mapping function failed: {0}")]
    Other(#[from] anyhow::Error),
}

/// Wraps a `StoreError` captured inside a `TableBuffer`; surfaced at the next
/// `drain`/`flush` await on that buffer.
#[derive(Debug, Error)]
#[error("flush of table '{table}' failed: {source}")]
pub struct FlushError {
    pub table: String,
    #[source]
    pub source: StoreError,
}
