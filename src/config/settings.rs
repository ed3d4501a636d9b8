use config::{Config, ConfigError, Environment};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub store: StoreSettings,
    pub indexer: IndexerSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreSettings {
    pub url: String,
    pub database: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexerSettings {
    #[serde(default = "default_item_low_watermark")]
    pub item_low_watermark: u32,
    #[serde(default = "default_item_high_watermark")]
    pub item_high_watermark: u32,
    #[serde(default = "default_blocks_low_watermark")]
    pub blocks_low_watermark: u32,
    #[serde(default = "default_blocks_high_watermark")]
    pub blocks_high_watermark: u32,
}

fn default_item_low_watermark() -> u32 {
    8192
}

fn default_item_high_watermark() -> u32 {
    32768
}

fn default_blocks_low_watermark() -> u32 {
    1024
}

fn default_blocks_high_watermark() -> u32 {
    4096
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_log_filter() -> String {
    "info".to_owned()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self { filter: default_log_filter() }
    }
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(Environment::default().separator("__"))
            .set_default("indexer.item_low_watermark", 8192)?
            .set_default("indexer.item_high_watermark", 32768)?
            .set_default("indexer.blocks_low_watermark", 1024)?
            .set_default("indexer.blocks_high_watermark", 4096)?
            .set_default("logging.filter", "info")?
            .build()?;

        config.try_deserialize()
    }
}
