//! 规则同步命令行入口

use adx_shared::config::AppConfig;
use adx_shared::database::Database;
use adx_shared::observability;
use anyhow::Result;
use clap::Parser;
use rule_sync::cli::{Cli, CommandRunner};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = AppConfig::load("rule-sync").unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {}", e);
        AppConfig::default()
    });

    let _guard = observability::init(&config.observability()).await?;

    let db = Database::connect(&config.database).await?;
    info!(environment = %config.environment, "Connected to database");

    let runner = CommandRunner::new(db.clone(), config);
    let result = runner.run(cli.command).await;

    db.close().await;
    result
}
