//! Incremental aggregation of exchange summaries into hourly/daily buckets
//!
//! Every update is a read-modify-write of two buckets. To rule out lost
//! updates, summaries are routed by tenant id to a fixed set of shard actors.
//! Each shard is the single consumer of an ordered mpsc channel, so all
//! updates to any one bucket key are applied strictly one after another.
//! The store additionally applies the hourly and daily bucket of one
//! exchange in a single transaction.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use crate::analytics::models::{AggregationBucket, BucketKey, ExchangeSummary};
use crate::storage::Storage;

#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("aggregation shard {0} is no longer running")]
    ShardClosed(usize),
}

/// Message types for a shard actor
enum ShardMessage {
    /// Fold one exchange into its buckets
    Apply(ExchangeSummary),
    /// Acknowledge once every earlier message has been handled
    Flush(oneshot::Sender<()>),
}

/// Single writer for every tenant hashed to it
struct ShardActor {
    id: usize,
    receiver: mpsc::Receiver<ShardMessage>,
    storage: Arc<dyn Storage>,
}

impl ShardActor {
    async fn run(mut self) {
        while let Some(message) = self.receiver.recv().await {
            match message {
                ShardMessage::Apply(summary) => {
                    if let Err(err) = apply_summary(self.storage.as_ref(), &summary).await {
                        error!(
                            shard = self.id,
                            tenant_id = %summary.tenant_id,
                            error = %err,
                            "failed to update aggregation buckets"
                        );
                    }
                }
                ShardMessage::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }

        debug!(shard = self.id, "aggregation shard stopped");
    }
}

/// Apply one summary to its hourly and daily buckets
pub async fn apply_summary(
    storage: &dyn Storage,
    summary: &ExchangeSummary,
) -> anyhow::Result<Vec<AggregationBucket>> {
    let keys = BucketKey::for_timestamp(&summary.tenant_id, summary.timestamp);
    storage
        .upsert_buckets(&keys, &|bucket: AggregationBucket| bucket.record(summary))
        .await
}

pub struct AnalyticsAggregator {
    shards: Vec<mpsc::Sender<ShardMessage>>,
}

impl AnalyticsAggregator {
    /// Spawn `shard_count` shard actors, each with a channel of `buffer_size`
    pub fn new(storage: Arc<dyn Storage>, shard_count: usize, buffer_size: usize) -> Self {
        let shard_count = shard_count.max(1);
        let mut shards = Vec::with_capacity(shard_count);

        for id in 0..shard_count {
            let (tx, rx) = mpsc::channel(buffer_size.max(1));
            let actor = ShardActor {
                id,
                receiver: rx,
                storage: Arc::clone(&storage),
            };
            tokio::spawn(actor.run());
            shards.push(tx);
        }

        info!(shards = shard_count, "analytics aggregator started");

        Self { shards }
    }

    fn shard_for(&self, tenant_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        tenant_id.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    /// Queue a summary on its tenant's shard
    ///
    /// Waits for channel capacity, so callers on the cold path get
    /// backpressure instead of silent loss.
    pub async fn record(&self, summary: ExchangeSummary) -> Result<(), AggregatorError> {
        let shard = self.shard_for(&summary.tenant_id);
        self.shards[shard]
            .send(ShardMessage::Apply(summary))
            .await
            .map_err(|_| AggregatorError::ShardClosed(shard))
    }

    /// Resolve once every summary recorded before this call has been applied
    pub async fn flush(&self) {
        let mut acks = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            let (tx, rx) = oneshot::channel();
            if shard.send(ShardMessage::Flush(tx)).await.is_ok() {
                acks.push(rx);
            }
        }
        for ack in acks {
            let _ = ack.await;
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}
