//! Dynamic sets of device IDs, streamed to effects.
//!
//! The broker can grow a holder's membership after its effect has
//! started. [`IdSetProducer`] is the broker-facing half; [`IdSet`] is
//! what effects and algorithms see. `launch` is the key primitive: it
//! invokes a callback exactly once per successfully added ID — both the
//! ones already present and every later arrival — until the set closes.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::context::RunContext;
use crate::types::ClientId;

/// Callback invoked (as a spawned task) once per member ID.
pub type LaunchFn =
    Arc<dyn Fn(ClientId) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> + Send + Sync>;

/// Consumer view of a set of device IDs.
#[async_trait]
pub trait IdSet: Send + Sync {
    /// Spawn `f(id)` for every current member, and for every member
    /// added later, exactly once per successfully added ID. Returns
    /// once the set is closed. If `ctx` is cancelled, the set is closed
    /// asynchronously (Adds racing with the cancel still get their
    /// callback if they were accepted).
    async fn launch(&self, ctx: RunContext, f: LaunchFn);

    /// Point-in-time membership list.
    fn snapshot(&self) -> Vec<ClientId>;

    /// Stop accepting new members and end all `launch` loops.
    /// Idempotent.
    fn close(&self);

    /// Withdraw IDs from the set. Only legal after close; used by
    /// algorithms that have already taken responsibility for draining
    /// certain devices and must keep the effect wrapper from draining
    /// them again.
    ///
    /// Panics if the set is still open or an ID isn't present — both
    /// are programming errors.
    fn remove(&self, ids: &[ClientId]);

    fn describe(&self) -> String {
        let ids: Vec<String> = self.snapshot().iter().map(|id| id.to_string()).collect();
        ids.join(", ")
    }
}

#[derive(Default)]
struct Inner {
    // Producer side.
    ids: Vec<ClientId>,
    // Consumer side.
    closed: bool,
    listeners: Vec<mpsc::UnboundedSender<ClientId>>,
}

/// Producer half: the broker adds members here.
#[derive(Clone, Default)]
pub struct IdSetProducer {
    inner: Arc<Mutex<Inner>>,
}

impl IdSetProducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(&self) -> usize {
        self.inner.lock().unwrap().ids.len()
    }

    pub fn closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    /// Add members. Returns false — and adds nothing — if the set has
    /// been closed.
    pub fn add(&self, ids: &[ClientId]) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return false;
        }
        inner.ids.extend_from_slice(ids);
        // Listener channels are unbounded; fan-out never blocks the
        // broker.
        for i in 0..inner.listeners.len() {
            for id in ids {
                let _ = inner.listeners[i].send(id.clone());
            }
        }
        true
    }

    /// The consumer view handed to a holder's effect.
    pub fn consumer(&self) -> Arc<dyn IdSet> {
        Arc::new(DynamicIdSet {
            inner: self.inner.clone(),
        })
    }
}

struct DynamicIdSet {
    inner: Arc<Mutex<Inner>>,
}

impl DynamicIdSet {
    fn close_inner(inner: &Arc<Mutex<Inner>>) {
        let mut guard = inner.lock().unwrap();
        if guard.closed {
            return;
        }
        guard.closed = true;
        // Dropping the senders ends every launch loop.
        guard.listeners.clear();
    }
}

#[async_trait]
impl IdSet for DynamicIdSet {
    async fn launch(&self, ctx: RunContext, f: LaunchFn) {
        // Register the listener and snapshot existing members under one
        // lock, so no add can be both missed and duplicated.
        let (tx, mut rx) = mpsc::unbounded_channel();
        let snapshot = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.closed {
                inner.listeners.push(tx);
            }
            inner.ids.clone()
        };

        for id in snapshot {
            tokio::spawn(f(id));
        }

        let mut cancel_armed = true;
        loop {
            if cancel_armed {
                tokio::select! {
                    member = rx.recv() => match member {
                        Some(id) => { tokio::spawn(f(id)); }
                        None => return,
                    },
                    _ = ctx.cancelled() => {
                        // Close asynchronously in case an add is racing
                        // with the cancel; the accepted IDs still come
                        // through the listener before it drops.
                        let inner = self.inner.clone();
                        tokio::spawn(async move { Self::close_inner(&inner) });
                        cancel_armed = false;
                    }
                }
            } else {
                match rx.recv().await {
                    Some(id) => {
                        tokio::spawn(f(id));
                    }
                    None => return,
                }
            }
        }
    }

    fn snapshot(&self) -> Vec<ClientId> {
        self.inner.lock().unwrap().ids.clone()
    }

    fn close(&self) {
        Self::close_inner(&self.inner);
    }

    fn remove(&self, ids: &[ClientId]) {
        let mut inner = self.inner.lock().unwrap();
        assert!(
            inner.closed,
            "idset: tried to remove IDs from a set that is still open"
        );
        for id in ids {
            let pos = inner
                .ids
                .iter()
                .position(|x| x == id)
                .unwrap_or_else(|| panic!("idset: can't remove absent ID {id:?}"));
            inner.ids.remove(pos);
        }
    }
}

/// A degenerate set holding a single ID, used by algorithms that fan
/// sub-algorithms out one-per-device. Closing is a no-op: the parent
/// set owns the close.
pub struct FixedIdSet {
    id: Mutex<Option<ClientId>>,
}

impl FixedIdSet {
    pub fn new(id: ClientId) -> Arc<dyn IdSet> {
        Arc::new(FixedIdSet {
            id: Mutex::new(Some(id)),
        })
    }
}

#[async_trait]
impl IdSet for FixedIdSet {
    async fn launch(&self, ctx: RunContext, f: LaunchFn) {
        if let Some(id) = self.id.lock().unwrap().clone() {
            tokio::spawn(f(id));
        }
        ctx.cancelled().await;
    }

    fn snapshot(&self) -> Vec<ClientId> {
        match self.id.lock().unwrap().as_ref() {
            Some(id) => vec![id.clone()],
            None => Vec::new(),
        }
    }

    fn close(&self) {}

    fn remove(&self, ids: &[ClientId]) {
        let mut slot = self.id.lock().unwrap();
        for id in ids {
            if slot.as_ref() == Some(id) {
                *slot = None;
            } else {
                panic!("idset: can't remove absent ID {id:?}");
            }
        }
    }
}
