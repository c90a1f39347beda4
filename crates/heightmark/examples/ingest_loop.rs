//! Ingest loop over the in-memory store.
//!
//! Simulates a chain producing batches of blocks and writes each batch with
//! its checkpoint advance in one transaction, stopping on Ctrl-C or after
//! the chain tip. Run with `RUST_LOG=heightmark=debug` to see every commit.

use std::sync::Arc;
use std::time::Duration;

use heightmark::storage::{MemoryCheckpointStore, MemoryConnector};
use heightmark::{mutation, CheckpointConfig, CheckpointDatabase};
use serde_json::json;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const BATCH: i64 = 25;
const CHAIN_TIP: i64 = 200;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "heightmark=info,ingest_loop=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let store = MemoryCheckpointStore::new();
    let config = CheckpointConfig::new("memory://demo", "indexer", "chain-a");
    let mut db = CheckpointDatabase::new(config, MemoryConnector::new(store.clone()));

    let mut next = db.connect().await? + 1;
    info!(next, "resuming ingestion");

    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    while next <= CHAIN_TIP {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            _ = ticker.tick() => {
                let to = (next + BATCH - 1).min(CHAIN_TIP);
                let heights: Arc<Vec<i64>> = Arc::new((next..=to).collect());
                let outcome = db
                    .transact(next, to, move |tx| {
                        let heights = Arc::clone(&heights);
                        mutation(async move {
                            tx.upsert_many(
                                "blocks",
                                heights
                                    .iter()
                                    .map(|h| (h.to_string(), json!({ "height": h }))),
                            );
                            Ok(())
                        })
                    })
                    .await?;
                info!(from = next, to, attempts = outcome.attempts, "batch committed");
                next = to + 1;
            }
        }
    }

    // Heartbeat advance: no writes, deduplicated on repeat.
    db.advance(next - 1).await?;
    db.advance(next - 1).await?;

    info!(
        height = ?store.height("chain-a"),
        blocks = store.collection_len("blocks"),
        metrics = ?db.metrics(),
        "done"
    );
    db.close().await?;
    Ok(())
}
