//! In-memory ticket cache for one kitchen board.
//!
//! The store is the board's single source of truth. It is mutated only by
//! push-channel deliveries, full refreshes from the admin dashboard, and
//! server-confirmed mutation responses; there are no optimistic writes.
//!
//! Merging is forward-only: an update whose status ranks below the known
//! status is stale and ignored, and a ticket that left the board is
//! tombstoned so a late update cannot resurrect it. A snapshot drops only the
//! tombstones written before its fetch started; tombstones also expire by age
//! and are capped in number.

use chrono::{DateTime, Duration, Utc};
use indexmap::IndexMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::debug;

use crate::clock::Clock;
use crate::events::KdsEvent;
use crate::ticket::{Ticket, TicketItem, TicketStatus};

/// Effect of merging one ticket state into the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// The id was not on the board before.
    Inserted,
    /// The status moved forward.
    Advanced { from: TicketStatus },
    /// Same status, other fields changed.
    Refreshed,
    /// The ticket left the board.
    Removed,
    /// Nothing changed (duplicate delivery, tick, unknown removal).
    Unchanged,
    /// Older than what the store already knows; ignored.
    Stale,
}

impl Applied {
    pub fn changed(&self) -> bool {
        matches!(
            self,
            Applied::Inserted | Applied::Advanced { .. } | Applied::Refreshed | Applied::Removed
        )
    }
}

/// Status change observed while applying a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub ticket: Ticket,
    /// `None` when the ticket was first seen in this snapshot.
    pub previous: Option<TicketStatus>,
}

/// Server-confirmed partial update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TicketPatch {
    pub status: Option<TicketStatus>,
    pub estimated_prep_minutes: Option<i64>,
    pub items: Option<Vec<TicketItem>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ready_at: Option<DateTime<Utc>>,
    pub served_at: Option<DateTime<Utc>>,
}

impl From<&Ticket> for TicketPatch {
    fn from(t: &Ticket) -> Self {
        Self {
            status: Some(t.status),
            estimated_prep_minutes: Some(t.estimated_prep_minutes),
            items: Some(t.items.clone()),
            started_at: t.started_at,
            ready_at: t.ready_at,
            served_at: t.served_at,
        }
    }
}

const TOMBSTONE_TTL_MINUTES: i64 = 120;
const MAX_TOMBSTONES: usize = 1024;

/// Store position captured before fetching a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotMark(u64);

#[derive(Debug, Clone, Copy)]
struct Tombstone {
    seq: u64,
    at: DateTime<Utc>,
}

#[derive(Default)]
struct StoreInner {
    tickets: IndexMap<String, Ticket>,
    /// Oldest first.
    tombstones: IndexMap<String, Tombstone>,
    seq: u64,
}

impl StoreInner {
    fn bury(&mut self, id: &str, now: DateTime<Utc>) {
        self.seq += 1;
        self.tombstones.shift_remove(id);
        self.tombstones
            .insert(id.to_string(), Tombstone { seq: self.seq, at: now });
        self.prune_tombstones(now);
    }

    fn prune_tombstones(&mut self, now: DateTime<Utc>) {
        let horizon = now - Duration::minutes(TOMBSTONE_TTL_MINUTES);
        loop {
            let expired = match self.tombstones.first() {
                Some((_, t)) => self.tombstones.len() > MAX_TOMBSTONES || t.at <= horizon,
                None => false,
            };
            if !expired {
                break;
            }
            self.tombstones.shift_remove_index(0);
        }
    }
}

/// Shared, internally synchronized ticket cache.
///
/// Every effective mutation bumps a revision published on a `watch`
/// channel; view consumers re-derive columns when it changes.
pub struct TicketStore {
    inner: Mutex<StoreInner>,
    clock: Arc<dyn Clock>,
    revision: watch::Sender<u64>,
}

impl TicketStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Mutex::new(StoreInner::default()),
            clock,
            revision,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }

    /// Revision counter, bumped on every effective change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    /// Notify subscribers without changing any ticket, so time-derived
    /// fields get recomputed.
    pub fn touch(&self) {
        self.bump();
    }

    /// Active tickets in insertion order.
    pub fn get(&self) -> Vec<Ticket> {
        self.lock().tickets.values().cloned().collect()
    }

    pub fn ticket(&self, id: &str) -> Option<Ticket> {
        self.lock().tickets.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().tickets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().tickets.is_empty()
    }

    /// Capture before fetching a snapshot; pass to `apply_snapshot_since`.
    pub fn mark(&self) -> SnapshotMark {
        SnapshotMark(self.lock().seq)
    }

    pub fn is_tombstoned(&self, id: &str) -> bool {
        self.lock().tombstones.contains_key(id)
    }

    pub fn tombstone_count(&self) -> usize {
        self.lock().tombstones.len()
    }

    /// Replace the whole ticket set with a snapshot taken just now.
    pub fn apply_snapshot(&self, tickets: Vec<Ticket>) -> Vec<Transition> {
        let mark = self.mark();
        self.apply_snapshot_since(tickets, mark)
    }

    /// Replace the whole ticket set with an authoritative snapshot whose
    /// fetch started at `mark`.
    ///
    /// Duplicate ids collapse into one entry; a snapshot row older than the
    /// state already on the board keeps the newer local state, and ids removed
    /// after `mark` stay removed. Returns the status transitions the snapshot
    /// revealed.
    pub fn apply_snapshot_since(&self, tickets: Vec<Ticket>, mark: SnapshotMark) -> Vec<Transition> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let previous = std::mem::take(&mut inner.tickets);
        inner.tombstones.retain(|_, t| t.seq > mark.0);
        inner.prune_tombstones(now);

        let mut next: IndexMap<String, Ticket> = IndexMap::with_capacity(tickets.len());
        for mut incoming in tickets {
            if inner.tombstones.contains_key(&incoming.id) {
                debug!(ticket_id = %incoming.id, "Snapshot row for removed ticket ignored");
                continue;
            }
            if !incoming.status.is_active() {
                inner.bury(&incoming.id, now);
                next.shift_remove(&incoming.id);
                continue;
            }
            let base = next
                .get(&incoming.id)
                .or_else(|| previous.get(&incoming.id))
                .cloned();
            let merged = match base {
                Some(existing) => merge(&existing, incoming, now).unwrap_or(existing),
                None => {
                    incoming.clamp_timeline();
                    incoming
                }
            };
            next.insert(merged.id.clone(), merged);
        }

        let transitions: Vec<Transition> = next
            .values()
            .filter_map(|ticket| {
                let before = previous.get(&ticket.id).map(|t| t.status);
                (before != Some(ticket.status)).then(|| Transition {
                    ticket: ticket.clone(),
                    previous: before,
                })
            })
            .collect();

        let changed = previous != next;
        debug!(
            tickets = next.len(),
            transitions = transitions.len(),
            "Applied ticket snapshot"
        );
        inner.tickets = next;
        drop(inner);
        if changed {
            self.bump();
        }
        transitions
    }

    /// Merge a single push event.
    pub fn apply_event(&self, event: &KdsEvent) -> Applied {
        let applied = match event {
            KdsEvent::NewTicket(ticket) | KdsEvent::StatusChanged(ticket) => {
                self.upsert(ticket.clone())
            }
            KdsEvent::Cancelled { ticket_id, .. } => self.remove(ticket_id),
            KdsEvent::TimerTick => Applied::Unchanged,
        };
        if applied.changed() {
            self.bump();
        }
        applied
    }

    /// Apply a server-confirmed update to a ticket already on the board.
    pub fn patch(&self, id: &str, patch: TicketPatch) -> Applied {
        let Some(mut ticket) = self.ticket(id) else {
            return Applied::Unchanged;
        };
        if let Some(status) = patch.status {
            ticket.status = status;
        }
        if let Some(minutes) = patch.estimated_prep_minutes.filter(|m| *m > 0) {
            ticket.estimated_prep_minutes = minutes;
        }
        if let Some(items) = patch.items {
            ticket.items = items;
        }
        ticket.started_at = ticket.started_at.or(patch.started_at);
        ticket.ready_at = ticket.ready_at.or(patch.ready_at);
        ticket.served_at = ticket.served_at.or(patch.served_at);

        let applied = self.upsert(ticket);
        if applied.changed() {
            self.bump();
        }
        applied
    }

    fn upsert(&self, mut incoming: Ticket) -> Applied {
        let now = self.clock.now();
        let mut inner = self.lock();
        if inner.tombstones.contains_key(&incoming.id) {
            return Applied::Stale;
        }

        if !incoming.status.is_active() {
            inner.bury(&incoming.id, now);
            return match inner.tickets.shift_remove(&incoming.id) {
                Some(_) => Applied::Removed,
                None => Applied::Unchanged,
            };
        }

        let Some(existing) = inner.tickets.get(&incoming.id) else {
            incoming.clamp_timeline();
            inner.tickets.insert(incoming.id.clone(), incoming);
            return Applied::Inserted;
        };

        let from = existing.status;
        let Some(merged) = merge(existing, incoming, now) else {
            return Applied::Stale;
        };
        if &merged == existing {
            return Applied::Unchanged;
        }
        let advanced = merged.status != from;
        inner.tickets.insert(merged.id.clone(), merged);
        if advanced {
            Applied::Advanced { from }
        } else {
            Applied::Refreshed
        }
    }

    fn remove(&self, id: &str) -> Applied {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.bury(id, now);
        match inner.tickets.shift_remove(id) {
            Some(_) => Applied::Removed,
            None => Applied::Unchanged,
        }
    }
}

/// Forward-only merge of `incoming` over `existing`. `None` means stale.
///
/// Creation time and already-recorded transition timestamps are never
/// overwritten; a forward transition without a server timestamp is stamped
/// with `now`. Timestamps out of sequence are pulled forward.
fn merge(existing: &Ticket, incoming: Ticket, now: DateTime<Utc>) -> Option<Ticket> {
    if incoming.status.rank() < existing.status.rank() {
        return None;
    }
    let advanced = incoming.status.rank() > existing.status.rank();
    let mut merged = Ticket {
        created_at: existing.created_at,
        started_at: existing.started_at.or(incoming.started_at),
        ready_at: existing.ready_at.or(incoming.ready_at),
        served_at: existing.served_at.or(incoming.served_at),
        ..incoming
    };
    if advanced {
        let status = merged.status;
        merged.stamp_transition(status, now);
    }
    merged.clamp_timeline();
    Some(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{Duration, TimeZone};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn store() -> (TicketStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start()));
        (TicketStore::new(clock.clone()), clock)
    }

    fn ticket(id: &str, status: TicketStatus) -> Ticket {
        Ticket {
            id: id.to_string(),
            order_number: format!("#{id}"),
            table: "4".into(),
            items: Vec::new(),
            status,
            estimated_prep_minutes: 15,
            created_at: start(),
            started_at: None,
            ready_at: None,
            served_at: None,
        }
    }

    #[test]
    fn test_status_changed_applied_twice_is_idempotent() {
        let (store, _) = store();
        store.apply_event(&KdsEvent::NewTicket(ticket("t1", TicketStatus::Pending)));
        let event = KdsEvent::StatusChanged(ticket("t1", TicketStatus::Preparing));

        assert_eq!(
            store.apply_event(&event),
            Applied::Advanced {
                from: TicketStatus::Pending
            }
        );
        let once = store.get();
        let revision = store.revision();

        assert_eq!(store.apply_event(&event), Applied::Unchanged);
        assert_eq!(store.get(), once);
        assert_eq!(store.revision(), revision);
    }

    #[test]
    fn test_older_event_never_reverts_status() {
        let (store, _) = store();
        store.apply_event(&KdsEvent::StatusChanged(ticket("t1", TicketStatus::Ready)));
        let late = KdsEvent::StatusChanged(ticket("t1", TicketStatus::Preparing));
        assert_eq!(store.apply_event(&late), Applied::Stale);
        assert_eq!(store.ticket("t1").unwrap().status, TicketStatus::Ready);

        let older_still = KdsEvent::NewTicket(ticket("t1", TicketStatus::Pending));
        assert_eq!(store.apply_event(&older_still), Applied::Stale);
        assert_eq!(store.ticket("t1").unwrap().status, TicketStatus::Ready);
    }

    #[test]
    fn test_update_for_unknown_id_is_implicit_insert() {
        let (store, _) = store();
        let applied = store.apply_event(&KdsEvent::StatusChanged(ticket("t9", TicketStatus::Ready)));
        assert_eq!(applied, Applied::Inserted);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_cancelled_ticket_is_not_resurrected() {
        let (store, _) = store();
        store.apply_event(&KdsEvent::NewTicket(ticket("t1", TicketStatus::Pending)));
        let cancel = KdsEvent::Cancelled {
            ticket_id: "t1".into(),
            reason: None,
        };
        assert_eq!(store.apply_event(&cancel), Applied::Removed);
        assert_eq!(store.apply_event(&cancel), Applied::Unchanged);

        let late = KdsEvent::StatusChanged(ticket("t1", TicketStatus::Preparing));
        assert_eq!(store.apply_event(&late), Applied::Stale);
        assert!(store.is_empty());
    }

    #[test]
    fn test_served_status_removes_ticket() {
        let (store, _) = store();
        store.apply_event(&KdsEvent::NewTicket(ticket("t1", TicketStatus::Ready)));
        let applied = store.apply_event(&KdsEvent::StatusChanged(ticket("t1", TicketStatus::Served)));
        assert_eq!(applied, Applied::Removed);
        assert!(store.ticket("t1").is_none());
    }

    #[test]
    fn test_forward_transition_stamps_missing_timestamp_once() {
        let (store, clock) = store();
        store.apply_event(&KdsEvent::NewTicket(ticket("t1", TicketStatus::Pending)));
        clock.advance(Duration::minutes(3));
        store.apply_event(&KdsEvent::StatusChanged(ticket("t1", TicketStatus::Preparing)));
        clock.advance(Duration::minutes(4));
        store.apply_event(&KdsEvent::StatusChanged(ticket("t1", TicketStatus::Preparing)));

        let stored = store.ticket("t1").unwrap();
        assert_eq!(stored.started_at, Some(start() + Duration::minutes(3)));
        assert_eq!(stored.ready_at, None);
        assert_eq!(stored.created_at, start());
    }

    #[test]
    fn test_snapshot_dedupes_and_reports_transitions() {
        let (store, _) = store();
        store.apply_event(&KdsEvent::NewTicket(ticket("a", TicketStatus::Pending)));
        store.apply_event(&KdsEvent::NewTicket(ticket("gone", TicketStatus::Pending)));

        let transitions = store.apply_snapshot(vec![
            ticket("a", TicketStatus::Preparing),
            ticket("b", TicketStatus::Pending),
            ticket("b", TicketStatus::Pending),
        ]);

        let ids: Vec<String> = store.get().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(transitions.len(), 2);
        assert_eq!(transitions[0].previous, Some(TicketStatus::Pending));
        assert_eq!(transitions[0].ticket.status, TicketStatus::Preparing);
        assert_eq!(transitions[1].previous, None);
    }

    #[test]
    fn test_stale_snapshot_row_keeps_newer_local_state() {
        let (store, _) = store();
        store.apply_event(&KdsEvent::StatusChanged(ticket("a", TicketStatus::Ready)));
        let transitions = store.apply_snapshot(vec![ticket("a", TicketStatus::Preparing)]);
        assert!(transitions.is_empty());
        assert_eq!(store.ticket("a").unwrap().status, TicketStatus::Ready);
    }

    #[test]
    fn test_patch_applies_confirmed_status() {
        let (store, _) = store();
        store.apply_event(&KdsEvent::NewTicket(ticket("t1", TicketStatus::Pending)));
        let confirmed = ticket("t1", TicketStatus::Preparing);
        let applied = store.patch("t1", TicketPatch::from(&confirmed));
        assert_eq!(
            applied,
            Applied::Advanced {
                from: TicketStatus::Pending
            }
        );
        assert_eq!(store.patch("unknown", TicketPatch::default()), Applied::Unchanged);
    }

    #[test]
    fn test_snapshot_fetched_before_removal_does_not_resurrect() {
        let (store, _) = store();
        store.apply_event(&KdsEvent::NewTicket(ticket("t1", TicketStatus::Ready)));
        let mark = store.mark();
        store.patch("t1", TicketPatch::from(&ticket("t1", TicketStatus::Served)));

        let transitions = store.apply_snapshot_since(vec![ticket("t1", TicketStatus::Ready)], mark);
        assert!(transitions.is_empty());
        assert!(store.ticket("t1").is_none());
        assert!(store.is_tombstoned("t1"));

        // A snapshot fetched after the removal is authoritative again.
        store.apply_snapshot(vec![ticket("t1", TicketStatus::Ready)]);
        assert!(store.ticket("t1").is_some());
        assert_eq!(store.tombstone_count(), 0);
    }

    #[test]
    fn test_tombstones_expire_and_are_capped() {
        let (store, clock) = store();
        store.apply_event(&KdsEvent::Cancelled {
            ticket_id: "old".into(),
            reason: None,
        });
        clock.advance(Duration::minutes(TOMBSTONE_TTL_MINUTES + 1));
        store.apply_event(&KdsEvent::Cancelled {
            ticket_id: "new".into(),
            reason: None,
        });
        assert!(!store.is_tombstoned("old"));
        assert!(store.is_tombstoned("new"));
        assert_eq!(store.tombstone_count(), 1);

        for i in 0..MAX_TOMBSTONES + 10 {
            store.apply_event(&KdsEvent::Cancelled {
                ticket_id: format!("c{i}"),
                reason: None,
            });
        }
        assert_eq!(store.tombstone_count(), MAX_TOMBSTONES);
        assert!(!store.is_tombstoned("c0"));
        assert!(store.is_tombstoned(&format!("c{}", MAX_TOMBSTONES + 9)));
    }

    #[test]
    fn test_out_of_order_timestamps_are_clamped() {
        let (store, _) = store();
        let mut preparing = ticket("t1", TicketStatus::Preparing);
        preparing.started_at = Some(start() - Duration::minutes(5));
        store.apply_event(&KdsEvent::NewTicket(preparing));
        assert_eq!(store.ticket("t1").unwrap().started_at, Some(start()));

        let mut fresh = ticket("t2", TicketStatus::Preparing);
        fresh.started_at = Some(start() + Duration::minutes(8));
        store.apply_event(&KdsEvent::NewTicket(fresh));

        let mut ready = ticket("t2", TicketStatus::Ready);
        ready.ready_at = Some(start() + Duration::minutes(2));
        store.apply_event(&KdsEvent::StatusChanged(ready));
        let stored = store.ticket("t2").unwrap();
        assert_eq!(stored.started_at, Some(start() + Duration::minutes(8)));
        assert_eq!(stored.ready_at, Some(start() + Duration::minutes(8)));
    }

    #[test]
    fn test_revision_bumps_only_on_change() {
        let (store, _) = store();
        let rx = store.subscribe();
        store.apply_event(&KdsEvent::TimerTick);
        assert_eq!(*rx.borrow(), 0);
        store.apply_event(&KdsEvent::NewTicket(ticket("t1", TicketStatus::Pending)));
        assert_eq!(*rx.borrow(), 1);
    }
}
