use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sales_ingestor::address::validator::HttpAddressValidator;
use sales_ingestor::db::Db;
use sales_ingestor::payload::{IngestSettings, UploadPayload};
use sales_ingestor::util::env as env_util;
use sales_ingestor::{cleanup, pipeline};
use sqlx::Row;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "si", version, about = "Sales ingestion admin CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Commands {
    /// Run the full ingestion pipeline for one upload
    Run {
        /// Path to the caller payload JSON (fields + metadata)
        #[arg(long)]
        payload: PathBuf,
        /// Path to the Arrow upload (file or stream format)
        #[arg(long)]
        upload: PathBuf,
        /// Per-upload staging table name inside the sales schema
        #[arg(long)]
        staging_table: String,
        /// Override the chunk-size target
        #[arg(long)]
        target_rows_per_chunk: Option<i64>,
    },
    /// Drop an upload's staging table and any residual siblings
    Cleanup {
        /// Path to the caller payload JSON (fields + metadata)
        #[arg(long)]
        payload: PathBuf,
        #[arg(long)]
        staging_table: String,
    },
    /// Print row counts for the EAV relations
    DbCounts,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_util::init_env();
    sales_ingestor::tracing::init_tracing("info,sqlx=warn")?;
    let cli = Cli::parse();

    let database_url = env_util::db_url()?;
    let max_conns: u32 = env_util::env_parse("DB_MAX_CONNS", 10u32);
    let db = Db::connect(&database_url, max_conns)
        .await
        .context("Db::connect failed")?;
    db.bootstrap_schema().await?;

    match cli.command {
        Commands::Run {
            payload,
            upload,
            staging_table,
            target_rows_per_chunk,
        } => {
            let payload = UploadPayload::from_json(
                &std::fs::read_to_string(&payload)
                    .with_context(|| format!("failed to read {}", payload.display()))?,
            )?;
            let mut settings = IngestSettings::new(payload, staging_table)?;
            if let Some(target) = target_rows_per_chunk {
                settings = settings.with_target_rows_per_chunk(target);
            }
            let blob = std::fs::read(&upload)
                .with_context(|| format!("failed to read {}", upload.display()))?;
            let validator = HttpAddressValidator::from_env()?;
            let report = pipeline::run_pipeline(&db, &validator, &settings, &blob).await?;
            info!(?report, "pipeline finished");
        }
        Commands::Cleanup {
            payload,
            staging_table,
        } => {
            let payload = UploadPayload::from_json(
                &std::fs::read_to_string(&payload)
                    .with_context(|| format!("failed to read {}", payload.display()))?,
            )?;
            let settings = IngestSettings::new(payload, staging_table)?;
            cleanup::cleanup(&db.pool, &settings).await?;
        }
        Commands::DbCounts => {
            for table in [
                "entity_types",
                "entities",
                "attributes",
                "entity_attribute_values",
                "client_header_map",
            ] {
                let n: i64 = sqlx::query(&format!("SELECT COUNT(*) FROM sales.{table}"))
                    .persistent(false)
                    .fetch_one(&db.pool)
                    .await?
                    .get(0);
                println!("{table:>24}: {n}");
            }
        }
    }
    Ok(())
}
