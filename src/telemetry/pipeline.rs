//! Cold-path processing of completed exchanges
//!
//! The proxy hands every exchange to [`TelemetryPipeline::submit`], which only
//! ever does a non-blocking enqueue. A fixed pool of workers drains the queue
//! and runs each exchange through the stages:
//!
//! geo resolution -> security scoring -> sizes -> persistence -> aggregation
//!
//! A failing stage is logged and the remaining stages still run. Each job
//! runs in its own task, so even a panic only loses that one exchange.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::analytics::{AggregatorError, AnalyticsAggregator, ExchangeSummary, GeoResolver};
use crate::config::TelemetryConfig;
use crate::models::{Exchange, ExchangeRecord};
use crate::security;
use crate::storage::Storage;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to persist exchange record: {0}")]
    Persist(#[source] anyhow::Error),
    #[error("failed to update aggregates: {0}")]
    Aggregate(#[from] AggregatorError),
    #[error("telemetry queue is full")]
    QueueFull,
    #[error("telemetry queue is closed")]
    QueueClosed,
}

/// Tracks accepted-but-unfinished exchanges
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn begin(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

struct Stages {
    storage: Arc<dyn Storage>,
    geo: GeoResolver,
    aggregator: Arc<AnalyticsAggregator>,
}

impl Stages {
    async fn process(&self, exchange: Exchange) {
        let location = self.geo.resolve(exchange.client_ip).await;
        let report = security::analyze(&exchange.request, &exchange.response);
        let record = ExchangeRecord::from_exchange(&exchange, location.as_ref(), &report);

        match self.storage.insert_exchange(&record).await {
            Ok(id) => debug!(
                tenant_id = %exchange.tenant_id,
                exchange_id = id,
                score = report.score,
                "exchange persisted"
            ),
            Err(err) => {
                let err = PipelineError::Persist(err);
                error!(tenant_id = %exchange.tenant_id, stage = "persist", error = %err, "telemetry stage failed");
            }
        }

        let summary = ExchangeSummary::new(&exchange, &report, location.as_ref());
        if let Err(err) = self.aggregator.record(summary).await {
            let err = PipelineError::from(err);
            error!(tenant_id = %exchange.tenant_id, stage = "aggregate", error = %err, "telemetry stage failed");
        }
    }
}

pub struct TelemetryPipeline {
    sender: mpsc::Sender<Exchange>,
    in_flight: Arc<InFlight>,
    aggregator: Arc<AnalyticsAggregator>,
}

impl TelemetryPipeline {
    /// Start the worker pool
    pub fn new(
        storage: Arc<dyn Storage>,
        geo: GeoResolver,
        aggregator: Arc<AnalyticsAggregator>,
        config: &TelemetryConfig,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let in_flight = Arc::new(InFlight::default());
        let stages = Arc::new(Stages {
            storage,
            geo,
            aggregator: Arc::clone(&aggregator),
        });

        let workers = config.workers.max(1);
        for id in 0..workers {
            tokio::spawn(run_worker(
                id,
                Arc::clone(&receiver),
                Arc::clone(&stages),
                Arc::clone(&in_flight),
            ));
        }

        info!(
            workers,
            queue_capacity = config.queue_capacity,
            "telemetry pipeline started"
        );

        Self {
            sender,
            in_flight,
            aggregator,
        }
    }

    /// Enqueue an exchange without waiting
    ///
    /// A full queue drops the exchange; the caller's response is unaffected.
    pub fn submit(&self, exchange: Exchange) -> Result<(), PipelineError> {
        self.in_flight.begin();

        match self.sender.try_send(exchange) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.in_flight.finish();
                let (err, exchange) = match err {
                    mpsc::error::TrySendError::Full(exchange) => (PipelineError::QueueFull, exchange),
                    mpsc::error::TrySendError::Closed(exchange) => {
                        (PipelineError::QueueClosed, exchange)
                    }
                };
                warn!(tenant_id = %exchange.tenant_id, error = %err, "dropping exchange telemetry");
                Err(err)
            }
        }
    }

    /// Number of accepted exchanges that have not finished processing
    pub fn pending(&self) -> usize {
        self.in_flight.count.load(Ordering::SeqCst)
    }

    /// Resolve once every accepted exchange has been through all stages
    ///
    /// Aggregate updates may still be queued on the aggregator's shards;
    /// use [`TelemetryPipeline::drain`] to wait for those as well.
    pub async fn wait_idle(&self) {
        loop {
            // Register before checking so a concurrent finish() is not missed
            let notified = self.in_flight.idle.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Wait for the pipeline and then for every queued aggregate update
    pub async fn drain(&self) {
        self.wait_idle().await;
        self.aggregator.flush().await;
    }
}

async fn run_worker(
    id: usize,
    receiver: Arc<Mutex<mpsc::Receiver<Exchange>>>,
    stages: Arc<Stages>,
    in_flight: Arc<InFlight>,
) {
    loop {
        let next = receiver.lock().await.recv().await;
        let Some(exchange) = next else {
            break;
        };

        let tenant_id = exchange.tenant_id.clone();
        let job_stages = Arc::clone(&stages);
        let job = tokio::spawn(async move { job_stages.process(exchange).await });

        if let Err(err) = job.await {
            error!(worker = id, tenant_id = %tenant_id, error = %err, "telemetry job aborted");
        }
        in_flight.finish();
    }

    debug!(worker = id, "telemetry worker stopped");
}
