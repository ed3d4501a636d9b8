mod settings;

pub use settings::{IndexerSettings, LoggingSettings, Settings, StoreSettings};
