use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::error::{CorrelationError, XmppError};
use crate::stanza::{self, Element};

/// How many delivered identifiers are remembered to tell a repeat delivery
/// apart from an unknown one.
const DELIVERED_HISTORY: usize = 1024;

struct Slot {
    token: u64,
    sender: oneshot::Sender<Element>,
}

#[derive(Default)]
struct Table {
    pending: HashMap<String, Slot>,
    delivered: VecDeque<String>,
    next_token: u64,
}

impl Table {
    fn insert(&mut self, id: String, sender: oneshot::Sender<Element>) -> u64 {
        self.next_token = self.next_token.wrapping_add(1);
        let token = self.next_token;
        self.delivered.retain(|delivered| delivered != &id);
        self.pending.insert(id, Slot { token, sender });
        token
    }

    fn remove_if(&mut self, id: &str, token: u64) -> bool {
        match self.pending.get(id) {
            Some(slot) if slot.token == token => {
                self.pending.remove(id);
                true
            }
            _ => false,
        }
    }

    fn remember_delivered(&mut self, id: String) {
        if self.delivered.len() == DELIVERED_HISTORY {
            self.delivered.pop_front();
        }
        self.delivered.push_back(id);
    }
}

/// Table of in-flight request/response exchanges keyed by identifier.
///
/// The table lock only covers insert, lookup, and removal. Waiting happens on
/// the exchange's own oneshot receiver.
#[derive(Clone, Default)]
pub struct Correlator {
    table: Arc<Mutex<Table>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a fresh exchange. Must happen before the request is sent.
    pub fn begin(&self) -> PendingExchange {
        let mut table = self.lock();
        let mut id = stanza::new_id();
        while table.pending.contains_key(&id) {
            id = stanza::new_id();
        }
        let (sender, receiver) = oneshot::channel();
        let token = table.insert(id.clone(), sender);
        drop(table);

        PendingExchange {
            id,
            token,
            receiver: Some(receiver),
            table: Arc::clone(&self.table),
        }
    }

    /// Register an exchange under a caller-chosen identifier.
    pub fn begin_with(&self, id: impl Into<String>) -> Result<PendingExchange, XmppError> {
        let id = id.into();
        let mut table = self.lock();
        if table.pending.contains_key(&id) {
            return Err(XmppError::DuplicateExchange(id));
        }
        let (sender, receiver) = oneshot::channel();
        let token = table.insert(id.clone(), sender);
        drop(table);

        Ok(PendingExchange {
            id,
            token,
            receiver: Some(receiver),
            table: Arc::clone(&self.table),
        })
    }

    /// Deliver `payload` to the exchange registered under `id`.
    pub fn resolve(&self, id: &str, payload: Element) -> Result<(), CorrelationError> {
        let slot = {
            let mut table = self.lock();
            match table.pending.remove(id) {
                Some(slot) => {
                    table.remember_delivered(id.to_string());
                    slot
                }
                None if table.delivered.iter().any(|delivered| delivered == id) => {
                    error!(id = %id, "second delivery for an already answered exchange");
                    return Err(CorrelationError::AlreadyDelivered(id.to_string()));
                }
                None => {
                    warn!(id = %id, "response for unknown or expired exchange dropped");
                    return Err(CorrelationError::UnknownExchange(id.to_string()));
                }
            }
        };

        slot.sender.send(payload).map_err(|_| {
            debug!(id = %id, "exchange abandoned before its response arrived");
            CorrelationError::Abandoned(id.to_string())
        })
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.lock().pending.contains_key(id)
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Fail every outstanding exchange, e.g. when the stream goes away.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.lock().pending.drain().collect();
        let count = drained.len();
        if count > 0 {
            debug!(count, "cancelled pending exchanges");
        }
        count
    }
}

/// One registered exchange awaiting its response.
///
/// Dropping it without waiting abandons the exchange and removes its entry.
pub struct PendingExchange {
    id: String,
    token: u64,
    receiver: Option<oneshot::Receiver<Element>>,
    table: Arc<Mutex<Table>>,
}

impl std::fmt::Debug for PendingExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingExchange")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl PendingExchange {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the response, giving up after `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> Result<Element, XmppError> {
        let Some(receiver) = self.receiver.take() else {
            return Err(XmppError::ConnectionClosed);
        };

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(XmppError::ConnectionClosed),
            Err(_) => {
                self.remove();
                debug!(id = %self.id, "exchange timed out");
                Err(XmppError::Timeout {
                    id: self.id.clone(),
                    after: timeout,
                })
            }
        }
    }

    fn remove(&self) {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove_if(&self.id, self.token);
    }
}

impl Drop for PendingExchange {
    fn drop(&mut self) {
        self.remove();
    }
}
