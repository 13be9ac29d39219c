//! The settlement listener keeps one invoice subscription open against the Lightning node for the life of the server,
//! and hands every settled or canceled invoice to the settlement API.
//!
//! The listener runs in its own task:
//! * If the subscription cannot be opened, or it drops, the listener reconnects after an exponential backoff delay with
//!   jitter. It never gives up.
//! * Each update is handled as a separate job on an [`EventHandler`], so a slow reconciliation never holds up the
//!   next update.
//! * A job that fails on a database error is retried with backoff until it succeeds or the listener shuts down.
//! * Settlements are numbered by the node. The listener persists the highest settle index below which every
//!   settlement has been applied, and every subscription asks the node to replay what came after it. A settlement that
//!   could not be applied before a disconnect or restart is therefore delivered again.
//! * [`ListenerHandle::shutdown`] stops the listener from any state and waits for in-flight jobs to finish.
use std::{
    collections::BTreeMap,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use bitmarket_engine::{
    events::{EventHandler, EventProducer},
    gateway::{InvoiceUpdate, LightningGateway},
    MissRetryPolicy,
    SettlementApi,
    SettlementError,
    SettlementOutcome,
    SqliteDatabase,
};
use futures::StreamExt;
use log::*;
use rand::Rng;
use tokio::{sync::watch, task::JoinHandle};

use crate::config::ListenerConfig;

const JOB_BUFFER_SIZE: usize = 100;

/// Exponential backoff, doubling from `initial` up to `max`. Each delay is jittered down by up to half.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max: max.max(initial), current: initial }
    }

    /// The delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        let half = base / 2;
        let jitter_ms = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(jitter_ms)
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Tracks how far through the node's settlement feed the listener has got.
///
/// Jobs finish in any order. The cursor only moves past a settle index once every index at or below it that the
/// listener has started is finished.
#[derive(Debug, Default)]
pub struct SettleCursor {
    committed: u64,
    highest_done: u64,
    in_flight: BTreeMap<u64, usize>,
}

impl SettleCursor {
    pub fn new(committed: u64) -> Self {
        Self { committed, highest_done: committed, in_flight: BTreeMap::new() }
    }

    /// Every settlement up to and including this index has been applied.
    pub fn committed(&self) -> u64 {
        self.committed
    }

    pub fn start(&mut self, settle_index: u64) {
        *self.in_flight.entry(settle_index).or_default() += 1;
    }

    /// Marks one delivery of `settle_index` as applied. Returns the new committed index if it moved forward.
    pub fn finish(&mut self, settle_index: u64) -> Option<u64> {
        if let Some(count) = self.in_flight.get_mut(&settle_index) {
            *count -= 1;
            if *count == 0 {
                self.in_flight.remove(&settle_index);
            }
        }
        self.highest_done = self.highest_done.max(settle_index);
        let watermark = match self.in_flight.keys().next() {
            Some(first) => self.highest_done.min(first - 1),
            None => self.highest_done,
        };
        if watermark > self.committed {
            self.committed = watermark;
            Some(watermark)
        } else {
            None
        }
    }
}

type SharedCursor = Arc<Mutex<SettleCursor>>;

fn lock(cursor: &SharedCursor) -> std::sync::MutexGuard<'_, SettleCursor> {
    cursor.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Controls a running settlement listener.
///
/// Dropping the handle without calling [`ListenerHandle::shutdown`] also stops the listener, but nothing waits for
/// the jobs in flight.
pub struct ListenerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Stops the listener and waits for the jobs it already started to complete.
    pub async fn shutdown(self) {
        info!("🎧️ Shutting down the settlement listener");
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!("🎧️ The settlement listener did not shut down cleanly. {e}");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Starts the settlement listener.
pub fn start_settlement_listener<G: LightningGateway>(
    gateway: G,
    api: Arc<SettlementApi<SqliteDatabase>>,
    config: ListenerConfig,
) -> ListenerHandle {
    let (shutdown, signal) = watch::channel(false);
    let task = tokio::spawn(run_listener(gateway, api, config, signal));
    ListenerHandle { shutdown, task }
}

async fn run_listener<G: LightningGateway>(
    gateway: G,
    api: Arc<SettlementApi<SqliteDatabase>>,
    config: ListenerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let start_index = match api.settle_index().await {
        Ok(index) => index,
        Err(e) => {
            warn!("🎧️ Could not read the last applied settle index. Asking the node for every settlement. {e}");
            0
        },
    };
    let cursor = Arc::new(Mutex::new(SettleCursor::new(start_index)));
    let context = JobContext { api, config, cursor: Arc::clone(&cursor), shutdown: shutdown.clone() };
    let jobs = EventHandler::new(JOB_BUFFER_SIZE, settlement_job(context));
    let producer = jobs.subscribe();
    let jobs_task = tokio::spawn(jobs.start_handler());
    let mut backoff = Backoff::new(config.backoff_initial, config.backoff_max);
    info!("🎧️ Settlement listener started");
    'listener: loop {
        if *shutdown.borrow() {
            break;
        }
        let settle_index = lock(&cursor).committed();
        let subscription = tokio::select! {
            result = gateway.subscribe_settlements(settle_index) => result,
            _ = shutdown.changed() => break 'listener,
        };
        match subscription {
            Ok(mut updates) => {
                info!("🎧️ Subscribed to invoice updates from the node, after settle index {settle_index}");
                let mut received_any = false;
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => break 'listener,
                        item = updates.next() => match item {
                            Some(Ok(update)) => {
                                if !received_any {
                                    backoff.reset();
                                    received_any = true;
                                }
                                forward_update(&producer, &cursor, update).await;
                            },
                            Some(Err(e)) if e.is_transient() => {
                                warn!("🎧️ The invoice subscription failed. {e}");
                                break;
                            },
                            Some(Err(e)) => warn!("🎧️ Skipping an invoice update that could not be used. {e}"),
                            None => {
                                warn!("🎧️ The node closed the invoice subscription");
                                break;
                            },
                        }
                    }
                }
            },
            Err(e) => warn!("🎧️ Could not subscribe to invoice updates. {e}"),
        }
        let delay = backoff.next_delay();
        info!("🎧️ Reconnecting to the node in {delay:?}");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {},
            _ = shutdown.changed() => break 'listener,
        }
    }
    // Let the job handler drain
    drop(producer);
    if let Err(e) = jobs_task.await {
        error!("🎧️ The settlement job handler did not complete. {e}");
    }
    info!("🎧️ Settlement listener has stopped at settle index {}", lock(&cursor).committed());
}

async fn forward_update(producer: &EventProducer<InvoiceUpdate>, cursor: &SharedCursor, update: InvoiceUpdate) {
    if update.is_settled() || update.is_canceled() {
        debug!("🎧️ Invoice {} is {}", update.payment_hash, update.state);
        if update.settle_index > 0 {
            lock(cursor).start(update.settle_index);
        }
        producer.publish_event(update).await;
    } else {
        trace!("🎧️ Ignoring {} update for invoice {}", update.state, update.payment_hash);
    }
}

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Clone)]
struct JobContext {
    api: Arc<SettlementApi<SqliteDatabase>>,
    config: ListenerConfig,
    cursor: SharedCursor,
    shutdown: watch::Receiver<bool>,
}

fn settlement_job(context: JobContext) -> Arc<dyn Fn(InvoiceUpdate) -> Job + Send + Sync> {
    Arc::new(move |update: InvoiceUpdate| {
        let context = context.clone();
        Box::pin(async move { apply_update(context, update).await }) as Job
    })
}

/// Applies an update, retrying database failures until they clear or the listener shuts down. Only an update that
/// was applied, or that can never be applied, moves the settle index forward.
async fn apply_update(context: JobContext, update: InvoiceUpdate) {
    let JobContext { api, config, cursor, mut shutdown } = context;
    let hash = update.payment_hash.as_str();
    let mut backoff = Backoff::new(config.backoff_initial, config.backoff_max);
    loop {
        match handle_update(&api, &update, config.miss_retry).await {
            Ok(()) => break,
            Err(e) if e.is_retryable() => {
                if *shutdown.borrow() {
                    warn!("🎧️ Leaving invoice {hash} for the next run. {e}");
                    return;
                }
                let delay = backoff.next_delay();
                error!("🎧️ Could not apply the update for invoice {hash}. Retrying in {delay:?}. {e}");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {},
                    _ = shutdown.changed() => {
                        warn!("🎧️ Leaving invoice {hash} for the next run");
                        return;
                    },
                }
            },
            Err(e) => {
                error!("🎧️ Giving up on the update for invoice {hash}. {e}");
                break;
            },
        }
    }
    if update.settle_index == 0 {
        return;
    }
    let advanced = lock(&cursor).finish(update.settle_index);
    if let Some(index) = advanced {
        match api.record_settle_index(index).await {
            Ok(stored) => trace!("🎧️ Settlements up to index {stored} have been applied"),
            Err(e) => warn!("🎧️ Could not store settle index {index}. {e}"),
        }
    }
}

/// Applies one update from the node.
pub async fn handle_update(
    api: &SettlementApi<SqliteDatabase>,
    update: &InvoiceUpdate,
    policy: MissRetryPolicy,
) -> Result<(), SettlementError> {
    let hash = update.payment_hash.as_str();
    if update.is_settled() {
        match api.reconcile_update(update, policy).await? {
            SettlementOutcome::Settled { payment, wallet } => info!(
                "🎧️ Payment #{} settled. User {} credited with {}",
                payment.id, wallet.user_id, payment.amount_sats
            ),
            outcome => trace!("🎧️ Settlement for {hash} needed no action: {outcome:?}"),
        }
    } else if update.is_canceled() {
        api.fail_payment(hash, "The invoice was canceled by the node").await?;
    }
    Ok(())
}
