//! Command correlation — request-id keyed table of one-shot senders.
//!
//!   send_order ──register(request_id)──→ table ──→ CommandHandle
//!   push / reply ──resolve(request_id | venue order id)──→ oneshot fires once
//!   no push within timeout ──→ handle yields Unknown, entry removed
//!
//! An entry is removed the moment it resolves, so a second resolution for the
//! same command is a no-op.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// A push referencing the command arrived.
    Confirmed,
    Rejected { code: i64, message: String },
    /// No confirmation inside the timeout. Reconciled from later pushes.
    Unknown,
    /// Nothing was sent (e.g. cancel of an order that is no longer live).
    Skipped,
}

impl CommandOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, CommandOutcome::Confirmed | CommandOutcome::Skipped)
    }

    pub fn is_signature_rejected(&self) -> bool {
        matches!(self, CommandOutcome::Rejected { code, .. } if *code == 401 || *code == 403)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Place,
    Cancel,
}

#[derive(Debug)]
struct PendingEntry {
    kind: CommandKind,
    /// Venue order id a cancel targets.
    order_id: Option<String>,
    tx: oneshot::Sender<CommandOutcome>,
    registered_at: Instant,
}

#[derive(Debug, Default)]
pub struct PendingCommands {
    entries: Mutex<HashMap<String, PendingEntry>>,
}

impl PendingCommands {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn guard(&self) -> MutexGuard<'_, HashMap<String, PendingEntry>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn register(
        self: &Arc<Self>,
        request_id: &str,
        kind: CommandKind,
        order_id: Option<String>,
        timeout: Duration,
    ) -> CommandHandle {
        let (tx, rx) = oneshot::channel();
        self.guard().insert(
            request_id.to_string(),
            PendingEntry {
                kind,
                order_id,
                tx,
                registered_at: Instant::now(),
            },
        );
        CommandHandle {
            request_id: request_id.to_string(),
            rx,
            timeout,
            table: Some(Arc::clone(self)),
        }
    }

    /// Resolve by request id. Returns false when nothing was waiting.
    pub fn resolve(&self, request_id: &str, outcome: CommandOutcome) -> bool {
        let entry = self.guard().remove(request_id);
        match entry {
            Some(e) => {
                debug!(
                    "🔗 {:?} {} resolved as {:?} after {:?}",
                    e.kind,
                    request_id,
                    outcome,
                    e.registered_at.elapsed()
                );
                let _ = e.tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Resolve every pending cancel that targets `order_id`.
    pub fn resolve_cancels_for(&self, order_id: &str, outcome: CommandOutcome) -> usize {
        let keys: Vec<String> = self
            .guard()
            .iter()
            .filter(|(_, e)| e.kind == CommandKind::Cancel && e.order_id.as_deref() == Some(order_id))
            .map(|(k, _)| k.clone())
            .collect();
        keys.iter()
            .filter(|k| self.resolve(k, outcome.clone()))
            .count()
    }

    pub fn kind_of(&self, request_id: &str) -> Option<CommandKind> {
        self.guard().get(request_id).map(|e| e.kind)
    }

    /// Venue order id a pending cancel targets.
    pub fn cancel_target(&self, request_id: &str) -> Option<String> {
        self.guard()
            .get(request_id)
            .filter(|e| e.kind == CommandKind::Cancel)
            .and_then(|e| e.order_id.clone())
    }

    pub fn forget(&self, request_id: &str) {
        self.guard().remove(request_id);
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Awaitable result of one command.
#[derive(Debug)]
pub struct CommandHandle {
    request_id: String,
    rx: oneshot::Receiver<CommandOutcome>,
    timeout: Duration,
    table: Option<Arc<PendingCommands>>,
}

impl CommandHandle {
    /// Already-settled handle (nothing registered).
    pub fn ready(request_id: &str, outcome: CommandOutcome) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(outcome);
        Self {
            request_id: request_id.to_string(),
            rx,
            timeout: Duration::ZERO,
            table: None,
        }
    }

    /// Handle fed by an external sender; used where no table is involved.
    pub fn detached(request_id: &str, timeout: Duration) -> (oneshot::Sender<CommandOutcome>, Self) {
        let (tx, rx) = oneshot::channel();
        (
            tx,
            Self {
                request_id: request_id.to_string(),
                rx,
                timeout,
                table: None,
            },
        )
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub async fn outcome(mut self) -> CommandOutcome {
        match tokio::time::timeout(self.timeout, &mut self.rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without an answer
            Ok(Err(_)) => CommandOutcome::Unknown,
            Err(_) => {
                // Late resolutions must not find the entry.
                if let Some(table) = &self.table {
                    table.forget(&self.request_id);
                }
                // A resolution may have raced the timer.
                self.rx.try_recv().unwrap_or(CommandOutcome::Unknown)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_exactly_once() {
        let table = PendingCommands::new();
        let handle = table.register("r1", CommandKind::Place, None, Duration::from_millis(500));
        assert!(table.resolve("r1", CommandOutcome::Confirmed));
        assert!(!table.resolve("r1", CommandOutcome::Rejected { code: 1, message: "late".into() }));
        assert_eq!(handle.outcome().await, CommandOutcome::Confirmed);
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn times_out_to_unknown_and_drops_entry() {
        let table = PendingCommands::new();
        let handle = table.register("r2", CommandKind::Place, None, Duration::from_millis(20));
        assert_eq!(handle.outcome().await, CommandOutcome::Unknown);
        assert!(table.is_empty());
        // A confirmation arriving afterwards finds nothing to resolve.
        assert!(!table.resolve("r2", CommandOutcome::Confirmed));
    }

    #[tokio::test]
    async fn cancels_resolve_by_venue_order_id() {
        let table = PendingCommands::new();
        let a = table.register("c1", CommandKind::Cancel, Some("77".into()), Duration::from_secs(1));
        let _place = table.register("p1", CommandKind::Place, None, Duration::from_secs(1));
        assert_eq!(table.resolve_cancels_for("77", CommandOutcome::Confirmed), 1);
        assert_eq!(a.outcome().await, CommandOutcome::Confirmed);
        assert_eq!(table.len(), 1);
        assert_eq!(table.kind_of("p1"), Some(CommandKind::Place));
    }

    #[tokio::test]
    async fn ready_handles_settle_immediately() {
        let h = CommandHandle::ready("x", CommandOutcome::Skipped);
        assert_eq!(h.request_id(), "x");
        assert!(h.outcome().await.is_confirmed());
    }

    #[test]
    fn signature_rejection_is_recognised() {
        assert!(CommandOutcome::Rejected { code: 401, message: String::new() }.is_signature_rejected());
        assert!(!CommandOutcome::Rejected { code: 400, message: String::new() }.is_signature_rejected());
        assert!(!CommandOutcome::Unknown.is_confirmed());
    }
}
