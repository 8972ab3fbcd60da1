//! Pipeline driver: sequences the activities, fans out the parallel
//! stages, retries each activity with identical inputs, and always runs
//! cleanup whether the run succeeded or failed.
//!
//! The driver only branches on its input and on activity results, never on
//! wall clocks or ambient state, so a re-driven upload replays the same
//! decisions.

use anyhow::Result;
use futures::stream::{self, StreamExt, TryStreamExt};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

use crate::address::{self, validator::AddressValidator};
use crate::arrow_io;
use crate::chunks;
use crate::cleanup;
use crate::db::Db;
use crate::eav::prelude::{self, PreludeOutcome};
use crate::eav::transform::{self, TransformOutcome};
use crate::infer;
use crate::payload::{AddressScope, IngestSettings};
use crate::staging;
use crate::util::env as env_util;

const RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_INITIAL_SECS: u64 = 15;
const DEFAULT_TRANSFORM_PARALLELISM: usize = 4;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    pub staged_rows: u64,
    pub blank_order_rows: u64,
    pub addresses_resolved: usize,
    pub chunks: usize,
    pub transactions: usize,
    pub line_items: usize,
    pub skipped_chunks: usize,
}

/// Retry an activity with identical inputs: 3 attempts, 15 s initial
/// interval, exponential backoff with jitter.
pub async fn with_retries<T, F, Fut>(activity: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let initial = Duration::from_secs(env_util::env_parse(
        "RETRY_INITIAL_SECS",
        DEFAULT_RETRY_INITIAL_SECS,
    ));
    let mut delay = initial;
    let mut last_err = None;
    for attempt in 1..=RETRY_ATTEMPTS {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if attempt < RETRY_ATTEMPTS {
                    let jitter_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 5);
                    let wait = delay + Duration::from_millis(jitter_ms);
                    warn!(activity, attempt, error = %e, wait_ms = wait.as_millis() as u64,
                          "activity failed; retrying");
                    tokio::time::sleep(wait).await;
                    delay *= 2;
                }
                last_err = Some(e);
            }
        }
    }
    Err(last_err
        .unwrap_or_else(|| anyhow::anyhow!("activity {activity} failed with no error recorded"))
        .context(format!("activity {activity} exhausted its retries")))
}

/// Drive one upload end to end. Cleanup runs on both paths.
#[instrument(skip(db, validator, settings, upload), fields(upload = %settings.upload_id(), table = %settings.staging_table))]
pub async fn run_pipeline(
    db: &Db,
    validator: &dyn AddressValidator,
    settings: &IngestSettings,
    upload: &[u8],
) -> Result<PipelineReport> {
    settings.payload.validate()?;

    let result = run_stages(db, validator, settings, upload).await;

    // Cleanup on success and on failure; a cleanup error never masks the
    // pipeline error.
    match cleanup::cleanup(&db.pool, settings).await {
        Ok(()) => {}
        Err(e) if result.is_ok() => return Err(e.context("cleanup failed after success")),
        Err(e) => error!(error = %e, "cleanup failed after pipeline failure"),
    }
    result
}

async fn run_stages(
    db: &Db,
    validator: &dyn AddressValidator,
    settings: &IngestSettings,
    upload: &[u8],
) -> Result<PipelineReport> {
    let pool = &db.pool;
    let mut report = PipelineReport::default();

    // Staging: create + ingest form one retryable unit so a retry starts
    // from a fresh table instead of doubling rows.
    let (schema, batches) = arrow_io::read_batches(upload)?;
    report.staged_rows = with_retries("stage_upload", || async {
        staging::create_staging_table(pool, settings, &schema).await?;
        staging::ingest_batches(pool, settings, &batches).await
    })
    .await?;

    report.blank_order_rows =
        with_retries("intermediate_processing", || staging::delete_blank_orders(pool, settings))
            .await?;

    with_retries("infer_data_types", || infer::infer_data_types(pool, settings)).await?;

    // Address canonicalization; identical scope maps validate once.
    if address::scopes_identical(settings) {
        report.addresses_resolved =
            canonicalize_scope(pool, validator, settings, AddressScope::Billing).await?;
        with_retries("copy_shipping_ids", || {
            address::copy_billing_ids_to_shipping(pool, settings)
        })
        .await?;
    } else {
        let (billing, shipping) = tokio::join!(
            canonicalize_scope(pool, validator, settings, AddressScope::Billing),
            canonicalize_scope(pool, validator, settings, AddressScope::Shipping),
        );
        report.addresses_resolved = billing? + shipping?;
    }

    match with_retries("eav_prelude", || prelude::eav_prelude(pool, settings)).await? {
        PreludeOutcome::Done { attributes, .. } => {
            info!(attributes, "prelude owned the upload setup")
        }
        PreludeOutcome::Skipped => info!("prelude skipped; another attempt owns the setup"),
    }

    let chunk_ids = with_retries("assign_chunks", || chunks::assign_chunks(pool, settings)).await?;
    report.chunks = chunk_ids.len();

    let parallelism = env_util::env_parse("TRANSFORM_PARALLELISM", DEFAULT_TRANSFORM_PARALLELISM);
    let outcomes: Vec<TransformOutcome> = stream::iter(chunk_ids)
        .map(|chunk_id| async move {
            with_retries("eav_transform_chunk", || {
                transform::eav_transform_chunk(pool, settings, chunk_id)
            })
            .await
        })
        .buffer_unordered(parallelism.max(1))
        .try_collect()
        .await?;
    for outcome in outcomes {
        match outcome {
            TransformOutcome::Done {
                transactions,
                line_items,
                ..
            } => {
                report.transactions += transactions;
                report.line_items += line_items;
            }
            TransformOutcome::Skipped => report.skipped_chunks += 1,
        }
    }

    info!(
        transactions = report.transactions,
        line_items = report.line_items,
        chunks = report.chunks,
        "pipeline stages complete"
    );
    Ok(report)
}

async fn canonicalize_scope(
    pool: &sqlx::PgPool,
    validator: &dyn AddressValidator,
    settings: &IngestSettings,
    scope: AddressScope,
) -> Result<usize> {
    let plan = with_retries("plan_address_batches", || {
        address::plan_address_batches(pool, settings, scope)
    })
    .await?;
    if plan.ranges.is_empty() {
        return Ok(0);
    }
    let resolved: Vec<usize> = stream::iter(plan.ranges.clone())
        .map(|range| async move {
            with_retries("enrich_addresses_batch", || {
                address::enrich_addresses_batch(pool, validator, settings, scope, range)
            })
            .await
        })
        .buffer_unordered(plan.suggested_parallelism.max(1))
        .try_collect()
        .await?;
    Ok(resolved.into_iter().sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_stop_after_first_success() {
        std::env::set_var("RETRY_INITIAL_SECS", "0");
        let calls = AtomicU32::new(0);
        let out: Result<u32> = with_retries("t", || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 2 {
                    anyhow::bail!("transient")
                }
                Ok(n)
            }
        })
        .await;
        assert_eq!(out.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retries_exhaust_after_three_attempts() {
        std::env::set_var("RETRY_INITIAL_SECS", "0");
        let calls = AtomicU32::new(0);
        let out: Result<()> = with_retries("t", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { anyhow::bail!("always down") }
        })
        .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
