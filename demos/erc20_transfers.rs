//! Minimal end-to-end pipeline: a synthetic chain of blocks mapped to a
//! single `transfers` table. Run against a ClickHouse instance that already
//! has `blocks` and `transfers` tables matching the column contract in
//! `src/schema.rs`.

use chainsink::config::Settings;
use chainsink::demo::{Erc20Mapper, SyntheticSource};
use dotenv::dotenv;

#[tokio::main]
async fn main() {
    dotenv().ok();

    let settings = Settings::new().unwrap_or_else(|e| {
        eprintln!("failed to load configuration: {e}");
        std::process::exit(1);
    });

    let source = SyntheticSource::new(200, 10);
    let code = chainsink::run_program(settings, source, Erc20Mapper).await;
    std::process::exit(code);
}
