use crate::{
    fetch::gateway::GatewaySet,
    primitives::{
        SourceAddress,
        SourceOrigin,
    },
};

use std::{
    collections::{
        HashMap,
        VecDeque,
    },
    sync::Arc,
    time::{
        Duration,
        Instant,
    },
};

use tokio::{
    sync::mpsc,
    time::MissedTickBehavior,
};

use tracing::{
    debug,
    warn,
};

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("no gateway registered for origin {0}")]
    NoGateway(SourceOrigin),
    #[error("fetcher worker is no longer running")]
    WorkerGone,
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Hard bound on a single gateway request.
    pub fetch_timeout: Duration,
    /// Pause between request dispatches, not completions.
    pub fetch_pause: Duration,
    /// Age after which an unserved subscription is dropped.
    pub cleanup_time: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(300),
            fetch_pause: Duration::from_secs(1),
            cleanup_time: Duration::from_secs(1800),
        }
    }
}

type FetchCallback = Box<dyn FnOnce(Vec<u8>) + Send>;

struct Subscribe {
    address: SourceAddress,
    url: String,
    callback: FetchCallback,
}

/// Deduplicating, rate-limited gateway fetcher.
///
/// Every subscribed content hash is visited in round-robin cycles by a single
/// worker task that dispatches at most one request per `fetch_pause`. All
/// subscribers of a hash share the one in-flight request and each callback
/// fires exactly once when the fetch succeeds. Failed requests leave the
/// subscription in place for the next cycle; subscriptions nobody could serve
/// within `cleanup_time` are dropped and their callbacks never fire.
#[derive(Clone)]
pub struct SourceFetcher {
    cmd_tx: mpsc::UnboundedSender<Subscribe>,
    gateways: Arc<GatewaySet>,
}

impl SourceFetcher {
    /// Spawns the fetch worker and returns a cheap handle to it.
    pub fn new(gateways: Arc<GatewaySet>, config: FetcherConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(Worker::new(cmd_rx, config).run());
        Self { cmd_tx, gateways }
    }

    /// Registers `callback` to be invoked with the file's bytes once the
    /// address has been fetched. Subscribing again for the same address joins
    /// the existing subscription and resets its cleanup clock.
    pub fn subscribe(
        &self,
        address: SourceAddress,
        callback: impl FnOnce(Vec<u8>) + Send + 'static,
    ) -> Result<(), FetchError> {
        let url = self
            .gateways
            .url_for(&address)
            .ok_or(FetchError::NoGateway(address.origin))?;
        self.cmd_tx
            .send(Subscribe {
                address,
                url,
                callback: Box::new(callback),
            })
            .map_err(|_| FetchError::WorkerGone)
    }
}

struct Subscription {
    url: String,
    being_processed: bool,
    subscribers: Vec<FetchCallback>,
    last_touched: Instant,
}

struct Outcome {
    key: String,
    result: FetchResult,
}

enum FetchResult {
    Body(Vec<u8>),
    Status { status: u16, body: String },
    Transport(String),
}

struct Worker {
    cmd_rx: mpsc::UnboundedReceiver<Subscribe>,
    outcome_tx: mpsc::UnboundedSender<Outcome>,
    outcome_rx: mpsc::UnboundedReceiver<Outcome>,
    subscriptions: HashMap<String, Subscription>,
    cycle: VecDeque<String>,
    http: reqwest::Client,
    config: FetcherConfig,
}

impl Worker {
    fn new(cmd_rx: mpsc::UnboundedReceiver<Subscribe>, config: FetcherConfig) -> Self {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        Self {
            cmd_rx,
            outcome_tx,
            outcome_rx,
            subscriptions: HashMap::new(),
            cycle: VecDeque::new(),
            http: reqwest::Client::new(),
            config,
        }
    }

    async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.config.fetch_pause);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.cmd_rx.recv() => match command {
                    Some(subscribe) => self.handle_subscribe(subscribe),
                    // All handles dropped; nothing can subscribe anymore.
                    None => return,
                },
                Some(outcome) = self.outcome_rx.recv() => self.handle_outcome(outcome),
                _ = ticker.tick() => self.dispatch_next(),
            }
        }
    }

    fn handle_subscribe(&mut self, subscribe: Subscribe) {
        let key = subscribe.address.unique_id();
        match self.subscriptions.get_mut(&key) {
            Some(existing) => {
                // Repeat interest joins the in-flight subscription and resets
                // its cleanup clock.
                existing.last_touched = Instant::now();
                existing.subscribers.push(subscribe.callback);
            }
            None => {
                debug!(
                    target: "contract_verifier::fetcher",
                    %key,
                    url = %subscribe.url,
                    "subscribing"
                );
                self.subscriptions.insert(
                    key,
                    Subscription {
                        url: subscribe.url,
                        being_processed: false,
                        subscribers: vec![subscribe.callback],
                        last_touched: Instant::now(),
                    },
                );
            }
        }
    }

    /// Advances the cycle until one request is dispatched. Keys that are
    /// gone, already in flight, or expired are fast steps that do not consume
    /// the pause.
    fn dispatch_next(&mut self) {
        let mut remaining = self.subscriptions.len().max(self.cycle.len());
        while remaining > 0 {
            remaining -= 1;

            if self.cycle.is_empty() {
                self.cycle.extend(self.subscriptions.keys().cloned());
            }
            let Some(key) = self.cycle.pop_front() else {
                return;
            };
            let Some(subscription) = self.subscriptions.get_mut(&key) else {
                continue;
            };
            if subscription.being_processed {
                continue;
            }
            if subscription.last_touched.elapsed() > self.config.cleanup_time {
                // Removed before the callbacks run so they can never observe
                // their own subscription; they are discarded unfired.
                debug!(
                    target: "contract_verifier::fetcher",
                    %key,
                    "dropping stale subscription"
                );
                self.subscriptions.remove(&key);
                continue;
            }

            subscription.being_processed = true;
            let url = subscription.url.clone();
            self.spawn_fetch(key, url);
            return;
        }
    }

    fn spawn_fetch(&self, key: String, url: String) {
        let client = self.http.clone();
        let timeout = self.config.fetch_timeout;
        let outcome_tx = self.outcome_tx.clone();

        tokio::spawn(async move {
            let result = match client.get(&url).timeout(timeout).send().await {
                Ok(response) => {
                    let status = response.status();
                    match response.bytes().await {
                        Ok(body) if status.is_success() => FetchResult::Body(body.to_vec()),
                        Ok(body) => FetchResult::Status {
                            status: status.as_u16(),
                            body: String::from_utf8_lossy(&body[..body.len().min(256)])
                                .into_owned(),
                        },
                        Err(err) => FetchResult::Transport(err.to_string()),
                    }
                }
                Err(err) => FetchResult::Transport(err.to_string()),
            };
            let _ = outcome_tx.send(Outcome { key, result });
        });
    }

    fn handle_outcome(&mut self, outcome: Outcome) {
        match outcome.result {
            FetchResult::Body(body) => {
                // The subscription is removed before any callback runs.
                let Some(subscription) = self.subscriptions.remove(&outcome.key) else {
                    return;
                };
                debug!(
                    target: "contract_verifier::fetcher",
                    key = %outcome.key,
                    subscribers = subscription.subscribers.len(),
                    bytes = body.len(),
                    "fetched"
                );
                for callback in subscription.subscribers {
                    callback(body.clone());
                }
            }
            FetchResult::Status { status, body } => {
                warn!(
                    target: "contract_verifier::fetcher",
                    key = %outcome.key,
                    status,
                    %body,
                    "gateway answered with an error status"
                );
                if let Some(subscription) = self.subscriptions.get_mut(&outcome.key) {
                    subscription.being_processed = false;
                }
            }
            FetchResult::Transport(err) => {
                warn!(
                    target: "contract_verifier::fetcher",
                    key = %outcome.key,
                    %err,
                    "fetch failed"
                );
                if let Some(subscription) = self.subscriptions.get_mut(&outcome.key) {
                    subscription.being_processed = false;
                }
            }
        }
    }
}
