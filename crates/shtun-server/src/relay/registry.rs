//! Registry of tunnels waiting for a viewer.
//!
//! Maps each open tunnel id to a one-shot slot through which the HTTP side
//! delivers its [`Handoff`]. All map operations go through one mutex, so
//! consuming a slot is atomic: two requests racing on the same id see exactly
//! one success.

use shtun_core::{Handoff, TunnelError, TunnelId, TunnelResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// How many fresh ids `register_fresh` draws before giving up.
const MAX_ID_ATTEMPTS: usize = 8;

/// A registered tunnel, as reported by [`TunnelRegistry::list`].
#[derive(Debug, Clone)]
pub struct PendingTunnel {
    pub id: TunnelId,
    pub age: Duration,
}

struct SlotEntry {
    /// Distinguishes this registration from any later one reusing the id.
    token: u64,
    tx: oneshot::Sender<Handoff>,
    registered_at: Instant,
}

/// Process-wide table of tunnels awaiting a handoff.
pub struct TunnelRegistry {
    slots: Mutex<HashMap<TunnelId, SlotEntry>>,
    /// Unbounded when `None`.
    max_pending: Option<usize>,
    next_token: AtomicU64,
}

impl TunnelRegistry {
    /// Create an empty registry. With `Some(limit)`, at most `limit` slots
    /// may be open at once.
    pub fn new(max_pending: Option<usize>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            max_pending,
            next_token: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TunnelId, SlotEntry>> {
        // Every critical section is a single map operation.
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open a slot for `id`.
    ///
    /// Fails with `DuplicateIdentifier` if `id` is already registered, and
    /// with `CapacityExceeded` if a pending limit is set and reached.
    pub fn register(self: &Arc<Self>, id: TunnelId) -> TunnelResult<Slot> {
        let (tx, rx) = oneshot::channel();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        let mut slots = self.lock();
        if slots.contains_key(&id) {
            return Err(TunnelError::DuplicateIdentifier(id));
        }
        if let Some(limit) = self.max_pending {
            if slots.len() >= limit {
                return Err(TunnelError::CapacityExceeded(limit));
            }
        }
        slots.insert(
            id,
            SlotEntry {
                token,
                tx,
                registered_at: Instant::now(),
            },
        );
        drop(slots);

        debug!(tunnel = %id, "tunnel registered");
        Ok(Slot {
            id,
            token,
            rx,
            registry: Arc::clone(self),
        })
    }

    /// Open a slot under a freshly generated id, drawing again on collision.
    pub fn register_fresh(self: &Arc<Self>) -> TunnelResult<Slot> {
        let mut last_err = None;
        for _ in 0..MAX_ID_ATTEMPTS {
            match self.register(TunnelId::generate()) {
                Err(TunnelError::DuplicateIdentifier(id)) => {
                    warn!(tunnel = %id, "tunnel id collision, drawing another");
                    last_err = Some(TunnelError::DuplicateIdentifier(id));
                }
                other => return other,
            }
        }
        Err(last_err.unwrap_or_else(|| TunnelError::Other("no tunnel id attempts made".into())))
    }

    /// Remove the slot for `id` and hand back the means to deliver into it.
    ///
    /// Fails with `NotFound` if no such slot exists, or it was already
    /// consumed or expired.
    pub fn lookup_and_consume(&self, id: TunnelId) -> TunnelResult<SlotHandle> {
        match self.lock().remove(&id) {
            Some(entry) => {
                debug!(
                    tunnel = %id,
                    waited_ms = entry.registered_at.elapsed().as_millis() as u64,
                    "tunnel consumed"
                );
                Ok(SlotHandle { id, tx: entry.tx })
            }
            None => Err(TunnelError::NotFound(id)),
        }
    }

    /// Remove the entry for `id` only if it still belongs to `token`.
    /// Returns whether it was removed.
    fn remove_own(&self, id: TunnelId, token: u64) -> bool {
        let mut slots = self.lock();
        let owned = slots.get(&id).is_some_and(|entry| entry.token == token);
        if owned {
            slots.remove(&id);
        }
        owned
    }

    /// Whether a slot for `id` is currently open.
    #[cfg(test)]
    pub fn contains(&self, id: TunnelId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Number of open slots.
    pub fn count(&self) -> usize {
        self.lock().len()
    }

    /// List all open slots.
    pub fn list(&self) -> Vec<PendingTunnel> {
        self.lock()
            .iter()
            .map(|(id, entry)| PendingTunnel {
                id: *id,
                age: entry.registered_at.elapsed(),
            })
            .collect()
    }

    /// Drop entries whose shell side is no longer waiting.
    ///
    /// Slots clean up after themselves when dropped; this catches anything
    /// that slipped past that path.
    pub fn sweep(&self) -> Vec<TunnelId> {
        let mut removed = Vec::new();
        self.lock().retain(|id, entry| {
            if entry.tx.is_closed() {
                removed.push(*id);
                false
            } else {
                true
            }
        });

        if !removed.is_empty() {
            info!(count = removed.len(), "swept orphaned tunnels");
        }
        removed
    }
}

/// The shell side's claim on a registered slot.
///
/// Dropping it removes the registry entry, so a shell session that ends
/// before a viewer arrives never leaves a stale slot behind.
pub struct Slot {
    id: TunnelId,
    token: u64,
    rx: oneshot::Receiver<Handoff>,
    registry: Arc<TunnelRegistry>,
}

impl Slot {
    pub fn id(&self) -> TunnelId {
        self.id
    }

    /// Wait up to `expiry` for a viewer's handoff.
    ///
    /// On timeout the slot is removed and `TunnelExpired` returned, unless a
    /// viewer consumed the slot in the meantime, in which case its handoff is
    /// still honoured.
    pub async fn await_handoff(mut self, expiry: Duration) -> TunnelResult<Handoff> {
        match tokio::time::timeout(expiry, &mut self.rx).await {
            Ok(Ok(handoff)) => Ok(handoff),
            Ok(Err(_)) => Err(TunnelError::Abandoned(self.id)),
            Err(_) => {
                if self.registry.remove_own(self.id, self.token) {
                    info!(tunnel = %self.id, expiry = ?expiry, "tunnel expired");
                    return Err(TunnelError::TunnelExpired(self.id));
                }
                // Consumed just as the timer fired; delivery follows the
                // consume without any await in between.
                (&mut self.rx)
                    .await
                    .map_err(|_| TunnelError::Abandoned(self.id))
            }
        }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if self.registry.remove_own(self.id, self.token) {
            debug!(tunnel = %self.id, "tunnel slot released");
        }
    }
}

/// The HTTP side's claim on a consumed slot.
pub struct SlotHandle {
    id: TunnelId,
    tx: oneshot::Sender<Handoff>,
}

impl SlotHandle {
    /// Hand the handoff to the waiting shell session.
    ///
    /// Fails with `Abandoned` if the shell session stopped waiting; the
    /// handoff is dropped, which fires its completion signal as aborted.
    pub fn deliver(self, handoff: Handoff) -> TunnelResult<()> {
        self.tx
            .send(handoff)
            .map_err(|_| TunnelError::Abandoned(self.id))
    }
}
