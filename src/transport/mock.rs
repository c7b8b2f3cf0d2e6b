//! Scripted transport for tests

use super::{Link, PairingMode, Transport, TransportEvent, TransportSession};
use crate::error::{TetherError, TetherResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Transport whose connections are driven by the test
#[derive(Default)]
pub(crate) struct MockTransport {
    fail_opens: AtomicBool,
    reject_opens: AtomicBool,
    open_delay: Mutex<Option<Duration>>,
    opens: Mutex<Vec<(String, PairingMode)>>,
    senders: Mutex<HashMap<String, mpsc::Sender<TransportEvent>>>,
    links: Mutex<Vec<(String, Arc<MockLink>)>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every subsequent open fail
    pub fn fail_opens(&self, fail: bool) {
        self.fail_opens.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent open fail with an error a reconnect cannot fix
    pub fn reject_opens(&self, reject: bool) {
        self.reject_opens.store(reject, Ordering::SeqCst);
    }

    /// Make every subsequent open take this long
    pub fn delay_opens(&self, delay: Duration) {
        *self.open_delay.lock() = Some(delay);
    }

    /// Number of open calls for a session
    pub fn open_count(&self, session_id: &str) -> usize {
        self.opens
            .lock()
            .iter()
            .filter(|(id, _)| id == session_id)
            .count()
    }

    /// Pairing mode used by the latest open for a session
    pub fn last_pairing(&self, session_id: &str) -> Option<PairingMode> {
        self.opens
            .lock()
            .iter()
            .rev()
            .find(|(id, _)| id == session_id)
            .map(|(_, mode)| mode.clone())
    }

    /// Push an event into the latest connection for a session
    pub async fn emit(&self, session_id: &str, event: TransportEvent) {
        let tx = self.senders.lock().get(session_id).cloned();
        if let Some(tx) = tx {
            let _ = tx.send(event).await;
        }
    }

    /// Whether the latest connection for a session was closed by the gateway
    pub fn was_closed(&self, session_id: &str) -> bool {
        self.links
            .lock()
            .iter()
            .rev()
            .find(|(id, _)| id == session_id)
            .is_some_and(|(_, link)| link.closed.load(Ordering::SeqCst))
    }

    /// Connections for a session that the gateway has not closed
    pub fn open_links(&self, session_id: &str) -> usize {
        self.links
            .lock()
            .iter()
            .filter(|(id, link)| id == session_id && !link.closed.load(Ordering::SeqCst))
            .count()
    }

    /// Drop the sender side, as if the transport vanished without a close event
    pub fn drop_channel(&self, session_id: &str) {
        self.senders.lock().remove(session_id);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(
        &self,
        session_id: &str,
        pairing: &PairingMode,
    ) -> TetherResult<TransportSession> {
        self.opens
            .lock()
            .push((session_id.to_string(), pairing.clone()));

        let delay = *self.open_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_opens.load(Ordering::SeqCst) {
            return Err(TetherError::transport("connection refused"));
        }
        if self.reject_opens.load(Ordering::SeqCst) {
            return Err(TetherError::InvalidSessionId(session_id.to_string()));
        }

        let (tx, rx) = mpsc::channel(32);
        let link = Arc::new(MockLink::default());
        self.senders.lock().insert(session_id.to_string(), tx);
        self.links
            .lock()
            .push((session_id.to_string(), Arc::clone(&link)));

        Ok(TransportSession {
            link: Box::new(SharedLink(link)),
            events: rx,
        })
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[derive(Default)]
pub(crate) struct MockLink {
    closed: AtomicBool,
}

struct SharedLink(Arc<MockLink>);

#[async_trait]
impl Link for SharedLink {
    async fn close(&self) {
        self.0.closed.store(true, Ordering::SeqCst);
    }
}
