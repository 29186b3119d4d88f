//! Helpers for exercising the signaling core without sockets.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::{
    calls::push::{PushError, PushNotifier, WakePayload},
    clock::{ManualClock, SharedClock},
    config::Config,
    db::Db,
    gateway::{events::ServerEvent, Gateway},
    pairing::PairingLedger,
    presence::ConnectionId,
};

/// Records every push it is asked to send. Tokens listed in `failing` get an
/// error back after being recorded.
pub struct RecordingNotifier {
    failing: Mutex<Vec<String>>,
    tx: UnboundedSender<(String, WakePayload)>,
    rx: tokio::sync::Mutex<UnboundedReceiver<(String, WakePayload)>>,
}

impl Default for RecordingNotifier {
    fn default() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            failing: Mutex::new(Vec::new()),
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }
}

impl RecordingNotifier {
    pub fn fail_for(&self, token: impl Into<String>) {
        self.failing.lock().push(token.into());
    }

    /// Waits for the next recorded push.
    pub async fn next(&self) -> (String, WakePayload) {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv()).await {
            Ok(Some(push)) => push,
            _ => panic!("no push was sent"),
        }
    }

    pub async fn try_next(&self) -> Option<(String, WakePayload)> {
        self.rx.lock().await.try_recv().ok()
    }
}

#[async_trait]
impl PushNotifier for RecordingNotifier {
    async fn notify(&self, token: &str, payload: &WakePayload) -> Result<(), PushError> {
        let _ = self.tx.send((token.to_owned(), payload.clone()));
        if self.failing.lock().iter().any(|t| t == token) {
            return Err(PushError::Rejected(410));
        }
        Ok(())
    }
}

/// A gateway over an in-memory store, a manual clock and a recording notifier.
pub struct Harness {
    pub gateway: Gateway,
    pub ledger: Arc<PairingLedger>,
    pub db: Db,
    pub clock: Arc<ManualClock>,
    pub pushes: Arc<RecordingNotifier>,
}

impl Harness {
    pub async fn new() -> Self {
        let config = Config::default();
        let db = Db::in_memory().await.expect("in-memory sqlite");
        let clock = Arc::new(ManualClock::default());
        let shared: SharedClock = clock.clone();
        let pushes = Arc::new(RecordingNotifier::default());

        let ledger = PairingLedger::load(db.clone(), shared.clone(), &config.pairing)
            .await
            .expect("empty ledger loads");
        let gateway = Gateway::new(db.clone(), pushes.clone(), shared, &config);

        Self {
            gateway,
            ledger: Arc::new(ledger),
            db,
            clock,
            pushes,
        }
    }

    /// Opens a connection and swallows its `welcome`.
    pub fn connect(&self) -> Client {
        let (id, mut rx) = self.gateway.connect();
        let _ = rx.try_recv();
        Client { id, rx }
    }
}

pub struct Client {
    pub id: ConnectionId,
    pub rx: UnboundedReceiver<ServerEvent>,
}

impl Client {
    pub fn drain(&mut self) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}
