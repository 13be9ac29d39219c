use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
        Mutex,
    },
    time::Duration,
};

use bitmarket_common::Sats;
use futures_util::{stream, StreamExt};
use log::*;
use tokio::sync::mpsc;

use crate::gateway::{
    CreatedInvoice,
    DecodedPaymentRequest,
    GatewayError,
    InvoiceState,
    InvoiceUpdate,
    LightningGateway,
    PaidInvoice,
    SettlementStream,
};

type Feed = mpsc::UnboundedReceiver<Result<InvoiceUpdate, GatewayError>>;

#[derive(Default)]
struct MockState {
    create_calls: AtomicUsize,
    pay_calls: AtomicUsize,
    subscribe_calls: AtomicUsize,
    last_settle_index: AtomicU64,
    delay: Mutex<Option<Duration>>,
    failure: Mutex<Option<GatewayError>>,
    feeds: Mutex<VecDeque<Feed>>,
    invoices: Mutex<HashMap<String, InvoiceUpdate>>,
    subscribed_from: Mutex<Vec<u64>>,
}

/// An in-memory Lightning gateway.
///
/// * Invoices get a random payment hash, and are always created unless a failure or delay has been configured. The
///   mock remembers every invoice it created, so that [`MockGateway::settle_invoice`] and
///   [`MockGateway::cancel_invoice`] can change their state on the "node".
/// * Each call to [`MockGateway::open_feed`] queues up one settlement subscription. `subscribe_settlements` hands out
///   the queued subscriptions in order, and reports the node as unavailable when there are none left. Dropping the
///   sender returned by `open_feed` ends that subscription.
/// * A subscription first replays every invoice settled on the node after the requested settle index, then carries
///   whatever the test sends on the feed.
#[derive(Clone, Default)]
pub struct MockGateway {
    state: Arc<MockState>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every subsequent create, pay or lookup call waits this long before answering.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.state.delay.lock().unwrap() = delay;
    }

    /// Every subsequent create, pay or lookup call fails with this error.
    pub fn set_failure(&self, failure: Option<GatewayError>) {
        *self.state.failure.lock().unwrap() = failure;
    }

    pub fn create_calls(&self) -> usize {
        self.state.create_calls.load(Ordering::SeqCst)
    }

    pub fn pay_calls(&self) -> usize {
        self.state.pay_calls.load(Ordering::SeqCst)
    }

    pub fn subscribe_calls(&self) -> usize {
        self.state.subscribe_calls.load(Ordering::SeqCst)
    }

    /// The settle index passed to each `subscribe_settlements` call, in order.
    pub fn subscribed_from(&self) -> Vec<u64> {
        self.state.subscribed_from.lock().unwrap().clone()
    }

    /// Queues a settlement subscription and returns the sending half, which the test uses to play node events.
    pub fn open_feed(&self) -> mpsc::UnboundedSender<Result<InvoiceUpdate, GatewayError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.feeds.lock().unwrap().push_back(rx);
        tx
    }

    /// Settles an invoice on the node, giving it the next settle index. The update is returned so that the test can
    /// also deliver it live. Invoices the mock did not create are settled all the same.
    pub fn settle_invoice(&self, payment_hash: &str, amount: i64) -> InvoiceUpdate {
        let settle_index = self.state.last_settle_index.fetch_add(1, Ordering::SeqCst) + 1;
        let update = InvoiceUpdate { settle_index, ..Self::settled_update(payment_hash, amount) };
        self.state.invoices.lock().unwrap().insert(payment_hash.to_string(), update.clone());
        update
    }

    pub fn cancel_invoice(&self, payment_hash: &str) -> InvoiceUpdate {
        let update = Self::canceled_update(payment_hash);
        self.state.invoices.lock().unwrap().insert(payment_hash.to_string(), update.clone());
        update
    }

    /// A settled update that carries no settle index, as if from a node that does not number its settlements.
    pub fn settled_update(payment_hash: &str, amount: i64) -> InvoiceUpdate {
        InvoiceUpdate {
            payment_hash: payment_hash.to_string(),
            preimage: Some(format!("{:064x}", rand::random::<u128>())),
            settled: true,
            amount_paid: Sats::from(amount),
            memo: None,
            state: InvoiceState::Settled,
            settle_index: 0,
        }
    }

    pub fn canceled_update(payment_hash: &str) -> InvoiceUpdate {
        InvoiceUpdate { settled: false, preimage: None, state: InvoiceState::Canceled, ..Self::open_update(payment_hash) }
    }

    fn open_update(payment_hash: &str) -> InvoiceUpdate {
        InvoiceUpdate {
            payment_hash: payment_hash.to_string(),
            preimage: None,
            settled: false,
            amount_paid: Sats::from(0),
            memo: None,
            state: InvoiceState::Open,
            settle_index: 0,
        }
    }

    fn settled_since(&self, settle_index: u64) -> Vec<InvoiceUpdate> {
        let mut settled = self
            .state
            .invoices
            .lock()
            .unwrap()
            .values()
            .filter(|u| u.settle_index > settle_index)
            .cloned()
            .collect::<Vec<_>>();
        settled.sort_by_key(|u| u.settle_index);
        settled
    }

    async fn simulate_node(&self) -> Result<(), GatewayError> {
        let delay = *self.state.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.state.failure.lock().unwrap().clone();
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Reads the amount from the human-readable part of a BOLT11 request, e.g. `lnbcrt15u1...` is 1,500 sats.
fn bolt11_amount(payment_request: &str) -> Option<Sats> {
    let request = payment_request.to_ascii_lowercase();
    let rest = ["lnbcrt", "lnbc", "lntbs", "lntb"].iter().find_map(|p| request.strip_prefix(p))?;
    let digits_len = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
    let (digits, tail) = rest.split_at(digits_len);
    let (millisats_per_unit, tail) = match tail.chars().next() {
        Some('m') => (100_000_000, &tail[1..]),
        Some('u') => (100_000, &tail[1..]),
        Some('n') => (100, &tail[1..]),
        _ => (100_000_000_000, tail),
    };
    match (digits.parse::<i64>(), tail.starts_with('1')) {
        (Ok(value), true) => value.checked_mul(millisats_per_unit).map(|msat| Sats::from(msat / 1000)),
        // No amount. The separator is all there is
        _ if rest.starts_with('1') => Some(Sats::from(0)),
        _ => None,
    }
}

impl LightningGateway for MockGateway {
    fn provider_name(&self) -> &str {
        "mock"
    }

    async fn create_invoice(&self, amount: Sats, memo: &str) -> Result<CreatedInvoice, GatewayError> {
        self.state.create_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_node().await?;
        let payment_hash = format!("{:032x}{:032x}", rand::random::<u128>(), rand::random::<u128>());
        let payment_request = format!("lnbcrt{}n1mock{}", amount.value() * 10, &payment_hash[..16]);
        trace!("🧪️ Mock invoice {payment_hash} for {amount} ({memo})");
        self.state.invoices.lock().unwrap().insert(payment_hash.clone(), Self::open_update(&payment_hash));
        Ok(CreatedInvoice { payment_request, payment_hash })
    }

    async fn decode_payment_request(&self, payment_request: &str) -> Result<DecodedPaymentRequest, GatewayError> {
        let amount = bolt11_amount(payment_request)
            .ok_or_else(|| GatewayError::Rejected(format!("invalid payment request: {payment_request}")))?;
        let payment_hash = format!("{:064x}", rand::random::<u128>());
        Ok(DecodedPaymentRequest { payment_hash, amount })
    }

    async fn pay_invoice(&self, payment_request: &str) -> Result<PaidInvoice, GatewayError> {
        self.state.pay_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_node().await?;
        trace!("🧪️ Mock payment of {payment_request}");
        Ok(PaidInvoice {
            payment_hash: format!("{:064x}", rand::random::<u128>()),
            payment_preimage: format!("{:064x}", rand::random::<u128>()),
            amount: bolt11_amount(payment_request).unwrap_or_default(),
            fee: Sats::from(0),
        })
    }

    async fn lookup_invoice(&self, payment_hash: &str) -> Result<InvoiceUpdate, GatewayError> {
        self.simulate_node().await?;
        self.state
            .invoices
            .lock()
            .unwrap()
            .get(payment_hash)
            .cloned()
            .ok_or_else(|| GatewayError::Rejected(format!("unable to locate invoice {payment_hash}")))
    }

    async fn subscribe_settlements(&self, settle_index: u64) -> Result<SettlementStream, GatewayError> {
        self.state.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        self.state.subscribed_from.lock().unwrap().push(settle_index);
        let feed = self.state.feeds.lock().unwrap().pop_front();
        match feed {
            Some(rx) => {
                let replay = stream::iter(self.settled_since(settle_index).into_iter().map(Ok));
                let live = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
                Ok(replay.chain(live).boxed())
            },
            None => Err(GatewayError::Unavailable("No settlement feed has been opened".to_string())),
        }
    }
}
