//! # Priority Queue
//!
//! The bounded waiting area for requests that could not be admitted on
//! arrival, and the [`Ticket`] a caller holds while waiting.
//!
//! ## Ordering
//!
//! ```text
//!     key = (Reverse(priority), arrival sequence)
//!
//!     BTreeMap<key, entry>          HashMap<id, key>
//!     ┌──────────────────────┐      ┌──────────────┐
//!     │ (-10, 4)  api_key:a  │ ◄─── │ 4 → (-10, 4) │   higher priority first,
//!     │ (  0, 1)  user:x     │      │ 1 → (  0, 1) │   then earliest arrival
//!     │ (  0, 3)  user:y     │      │ 3 → (  0, 3) │
//!     └──────────────────────┘      └──────────────┘
//! ```
//!
//! Insert, peek and removal by id are O(log n). Sequence numbers are handed
//! out under the queue lock, so arrival order is the order entries were
//! accepted and never changes afterwards.
//!
//! A new entry always has the largest sequence number, so the entries ahead
//! of it are exactly those of equal or higher priority. A count per waiting
//! priority level gives that number without walking the entries; the cost
//! grows with the number of distinct priorities waiting, not with queue
//! length.
//!
//! ## Entry lifecycle
//!
//! ```text
//!     Queued ──► Admitted   (drain)
//!        │──► Rejected   (timeout, administrative clear)
//!        └──► Removed    (ticket cancelled or dropped)
//! ```
//!
//! Every exit takes the entry out of the map, so a terminal entry can never
//! be seen again.

use super::config::{Identity, Scope};
use super::core::{EngineInner, QueueOutcome, RejectReason};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;

/// Identifier of a queued entry, unique for the engine's lifetime.
pub type EntryId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: Reverse<i32>,
    seq: EntryId,
}

/// A request waiting for admission.
///
/// The priority is copied from the config in force at enqueue time and is
/// not re-read while the entry waits.
pub(crate) struct QueueEntry {
    pub(crate) id: EntryId,
    pub(crate) subject: Scope,
    pub(crate) identity: Identity,
    pub(crate) priority: i32,
    pub(crate) enqueued_at_ms: u64,
    pub(crate) deadline_ms: Option<u64>,
    pub(crate) ahead_at_enqueue: usize,
    notify: oneshot::Sender<QueueOutcome>,
}

impl QueueEntry {
    pub(crate) fn new(
        identity: Identity,
        priority: i32,
        enqueued_at_ms: u64,
        deadline_ms: Option<u64>,
        notify: oneshot::Sender<QueueOutcome>,
    ) -> Self {
        Self {
            id: 0,
            subject: identity.subject(),
            identity,
            priority,
            enqueued_at_ms,
            deadline_ms,
            ahead_at_enqueue: 0,
            notify,
        }
    }

    #[inline]
    pub(crate) fn is_expired(&self, now_ms: u64) -> bool {
        matches!(self.deadline_ms, Some(deadline) if now_ms >= deadline)
    }

    /// Hands the outcome to the waiting caller.
    ///
    /// Gives the outcome back if the caller is gone. The caller of this
    /// method decides when to drop it, since dropping an admitted outcome
    /// releases its slot.
    pub(crate) fn resolve(self, outcome: QueueOutcome) -> Result<(), QueueOutcome> {
        self.notify.send(outcome)
    }
}

impl fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueEntry")
            .field("id", &self.id)
            .field("subject", &self.subject)
            .field("priority", &self.priority)
            .field("enqueued_at_ms", &self.enqueued_at_ms)
            .field("deadline_ms", &self.deadline_ms)
            .finish()
    }
}

/// Bounded priority queue shared by every identity.
#[derive(Debug)]
pub(crate) struct PriorityQueue {
    entries: BTreeMap<QueueKey, QueueEntry>,
    index: HashMap<EntryId, QueueKey, ahash::RandomState>,
    per_subject: HashMap<Scope, usize, ahash::RandomState>,
    per_priority: BTreeMap<Reverse<i32>, usize>,
    next_seq: EntryId,
    max_size: usize,
}

impl PriorityQueue {
    pub(crate) fn new(max_size: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            index: HashMap::with_hasher(ahash::RandomState::new()),
            per_subject: HashMap::with_hasher(ahash::RandomState::new()),
            per_priority: BTreeMap::new(),
            next_seq: 1,
            max_size,
        }
    }

    /// Accepts `entry` unless the queue is full.
    ///
    /// On success returns the assigned id and the number of entries ahead of
    /// it. A full queue hands the entry back untouched.
    pub(crate) fn enqueue(&mut self, mut entry: QueueEntry) -> Result<(EntryId, usize), QueueEntry> {
        if self.entries.len() >= self.max_size {
            return Err(entry);
        }

        let id = self.next_seq;
        self.next_seq += 1;

        let key = QueueKey {
            priority: Reverse(entry.priority),
            seq: id,
        };
        let ahead: usize = self
            .per_priority
            .range(..=key.priority)
            .map(|(_, count)| *count)
            .sum();

        entry.id = id;
        entry.ahead_at_enqueue = ahead;
        *self.per_subject.entry(entry.subject.clone()).or_insert(0) += 1;
        *self.per_priority.entry(key.priority).or_insert(0) += 1;
        self.index.insert(id, key);
        self.entries.insert(key, entry);
        Ok((id, ahead))
    }

    /// The entry that would be served next.
    pub(crate) fn peek_next(&self) -> Option<&QueueEntry> {
        self.entries.values().next()
    }

    pub(crate) fn get(&self, id: EntryId) -> Option<&QueueEntry> {
        let key = self.index.get(&id)?;
        self.entries.get(key)
    }

    /// Takes an entry out of the queue, leaving the order of the rest intact.
    pub(crate) fn remove(&mut self, id: EntryId) -> Option<QueueEntry> {
        let key = self.index.remove(&id)?;
        let entry = self.entries.remove(&key)?;

        if let Some(count) = self.per_subject.get_mut(&entry.subject) {
            *count -= 1;
            if *count == 0 {
                self.per_subject.remove(&entry.subject);
            }
        }
        if let Some(count) = self.per_priority.get_mut(&key.priority) {
            *count -= 1;
            if *count == 0 {
                self.per_priority.remove(&key.priority);
            }
        }
        Some(entry)
    }

    /// Number of entries ahead of `id`.
    pub(crate) fn position_of(&self, id: EntryId) -> Option<usize> {
        let key = self.index.get(&id)?;
        Some(self.entries.range(..*key).count())
    }

    /// Ids in service order.
    pub(crate) fn ids(&self) -> Vec<EntryId> {
        self.entries.keys().map(|key| key.seq).collect()
    }

    /// Entries in service order.
    pub(crate) fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.values()
    }

    /// Number of entries waiting for `subject`.
    pub(crate) fn waiting_for(&self, subject: &Scope) -> usize {
        self.per_subject.get(subject).copied().unwrap_or(0)
    }

    /// Whether a fresh submission has to wait behind queued entries.
    ///
    /// A subject never overtakes its own queued entries. When every subject
    /// draws from one shared cap, a fresh submission also waits behind any
    /// entry of equal or higher priority.
    pub(crate) fn should_defer(&self, subject: &Scope, priority: i32, shared_cap: bool) -> bool {
        if self.waiting_for(subject) > 0 {
            return true;
        }
        shared_cap
            && self
                .peek_next()
                .is_some_and(|head| head.priority >= priority)
    }

    /// Removes every entry, in service order.
    pub(crate) fn take_all(&mut self) -> Vec<QueueEntry> {
        self.index.clear();
        self.per_subject.clear();
        self.per_priority.clear();
        std::mem::take(&mut self.entries).into_values().collect()
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Handle to a queued request.
///
/// A ticket resolves exactly once, to [`QueueOutcome::Admitted`] with a
/// permit or to [`QueueOutcome::Rejected`]. It can be awaited, waited on
/// from a plain thread, or polled with [`try_outcome`](Self::try_outcome).
///
/// Dropping an unresolved ticket cancels the request. If the request was
/// admitted in the meantime, the permit is dropped with the ticket and its
/// slot is released.
///
/// # Example
///
/// ```rust
/// use rater_admission::{AdmissionEngine, Identity, RateLimitConfig, Scope};
///
/// let engine = AdmissionEngine::new();
/// engine
///     .create_config(Scope::user("u"), RateLimitConfig::default().with_concurrency(1))
///     .unwrap();
///
/// let id = Identity::user("u");
/// let first = engine.submit(&id).into_permit().unwrap();
/// let mut ticket = engine.submit(&id).into_ticket().unwrap();
/// assert!(ticket.try_outcome().is_none());
///
/// drop(first); // frees the slot and drains the queue
/// let outcome = ticket.blocking_wait();
/// assert!(outcome.is_admitted());
/// ```
pub struct Ticket {
    id: EntryId,
    position: usize,
    estimated_wait: Duration,
    rx: Option<oneshot::Receiver<QueueOutcome>>,
    engine: Arc<EngineInner>,
}

impl Ticket {
    pub(crate) fn new(
        id: EntryId,
        position: usize,
        estimated_wait: Duration,
        rx: oneshot::Receiver<QueueOutcome>,
        engine: Arc<EngineInner>,
    ) -> Self {
        Self {
            id,
            position,
            estimated_wait,
            rx: Some(rx),
            engine,
        }
    }

    /// Engine-wide id of the queued entry.
    pub fn id(&self) -> EntryId {
        self.id
    }

    /// Entries ahead of this one when it was queued.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Expected wait at the time of queueing.
    pub fn estimated_wait(&self) -> Duration {
        self.estimated_wait
    }

    /// Entries currently ahead of this one, or `None` once it has left the
    /// queue.
    pub fn current_position(&self) -> Option<usize> {
        self.engine.queue.lock().position_of(self.id)
    }

    /// Returns the outcome if it is already known.
    pub fn try_outcome(&mut self) -> Option<QueueOutcome> {
        let rx = self.rx.as_mut()?;
        let outcome = match rx.try_recv() {
            Ok(outcome) => outcome,
            Err(oneshot::error::TryRecvError::Empty) => return None,
            Err(oneshot::error::TryRecvError::Closed) => QueueOutcome::Rejected(RejectReason::Shutdown),
        };
        self.rx = None;
        Some(outcome)
    }

    /// Blocks the current thread until the outcome is known.
    ///
    /// # Panics
    ///
    /// Panics when called from inside an asynchronous runtime; `.await` the
    /// ticket there instead.
    pub fn blocking_wait(mut self) -> QueueOutcome {
        match self.rx.take() {
            Some(rx) => rx
                .blocking_recv()
                .unwrap_or(QueueOutcome::Rejected(RejectReason::Shutdown)),
            None => QueueOutcome::Rejected(RejectReason::Shutdown),
        }
    }

    /// Withdraws the request.
    ///
    /// Returns `true` if the entry was still queued. `false` means the
    /// outcome was already decided; an admission decided concurrently is
    /// released.
    pub fn cancel(mut self) -> bool {
        let removed = self.engine.cancel_entry(self.id);
        self.rx = None;
        removed
    }
}

impl Future for Ticket {
    type Output = QueueOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(rx) = this.rx.as_mut() else {
            return Poll::Ready(QueueOutcome::Rejected(RejectReason::Shutdown));
        };

        match Pin::new(rx).poll(cx) {
            Poll::Ready(result) => {
                this.rx = None;
                Poll::Ready(result.unwrap_or(QueueOutcome::Rejected(RejectReason::Shutdown)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if self.rx.is_some() {
            self.engine.cancel_entry(self.id);
        }
    }
}

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticket")
            .field("id", &self.id)
            .field("position", &self.position)
            .field("estimated_wait", &self.estimated_wait)
            .field("resolved", &self.rx.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(
        user: &str,
        priority: i32,
        now: u64,
    ) -> (QueueEntry, oneshot::Receiver<QueueOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            QueueEntry::new(Identity::user(user), priority, now, None, tx),
            rx,
        )
    }

    fn push(queue: &mut PriorityQueue, user: &str, priority: i32) -> EntryId {
        let (e, _rx) = entry(user, priority, 0);
        queue.enqueue(e).unwrap().0
    }

    #[test]
    fn test_priority_then_fifo_order() {
        let mut queue = PriorityQueue::new(10);
        let a = push(&mut queue, "a", 0);
        let b = push(&mut queue, "b", 10);
        let c = push(&mut queue, "c", 0);
        let d = push(&mut queue, "d", 10);
        let e = push(&mut queue, "e", -5);

        assert_eq!(queue.ids(), vec![b, d, a, c, e]);
        assert_eq!(queue.peek_next().unwrap().id, b);
    }

    #[test]
    fn test_enqueue_reports_position() {
        let mut queue = PriorityQueue::new(10);
        let (e1, _r1) = entry("a", 0, 0);
        let (e2, _r2) = entry("b", 0, 0);
        let (e3, _r3) = entry("c", 5, 0);

        assert_eq!(queue.enqueue(e1).unwrap().1, 0);
        assert_eq!(queue.enqueue(e2).unwrap().1, 1);
        // Jumps both lower-priority entries
        let (id3, pos3) = queue.enqueue(e3).unwrap();
        assert_eq!(pos3, 0);
        assert_eq!(queue.get(id3).unwrap().ahead_at_enqueue, 0);
    }

    #[test]
    fn test_enqueue_position_with_mixed_priorities() {
        let mut queue = PriorityQueue::new(10);
        push(&mut queue, "a", 0);
        let high = push(&mut queue, "b", 10);
        push(&mut queue, "c", 5);
        push(&mut queue, "d", 10);

        // Behind both 10s and the earlier 5, ahead of the 0
        let (e, _r) = entry("e", 5, 0);
        let (id, pos) = queue.enqueue(e).unwrap();
        assert_eq!(pos, 3);
        assert_eq!(queue.position_of(id), Some(3));

        queue.remove(high);
        let (e, _r) = entry("f", 5, 0);
        let (id, pos) = queue.enqueue(e).unwrap();
        assert_eq!(pos, 3);
        assert_eq!(queue.position_of(id), Some(3));

        let (e, _r) = entry("g", 11, 0);
        assert_eq!(queue.enqueue(e).unwrap().1, 0);

        queue.take_all();
        let (e, _r) = entry("h", -1, 0);
        assert_eq!(queue.enqueue(e).unwrap().1, 0);
    }

    #[test]
    fn test_bounded_size() {
        let mut queue = PriorityQueue::new(2);
        push(&mut queue, "a", 0);
        push(&mut queue, "b", 0);

        let (e, _rx) = entry("c", 100, 0);
        let rejected = queue.enqueue(e).unwrap_err();
        assert_eq!(rejected.subject, Scope::user("c"));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_remove_keeps_remaining_order() {
        let mut queue = PriorityQueue::new(10);
        let a = push(&mut queue, "a", 1);
        let b = push(&mut queue, "b", 1);
        let c = push(&mut queue, "c", 1);

        let removed = queue.remove(b).unwrap();
        assert_eq!(removed.subject, Scope::user("b"));
        assert!(queue.remove(b).is_none());
        assert_eq!(queue.ids(), vec![a, c]);
        assert_eq!(queue.position_of(c), Some(1));
        assert_eq!(queue.position_of(b), None);
    }

    #[test]
    fn test_per_subject_counts() {
        let mut queue = PriorityQueue::new(10);
        let a1 = push(&mut queue, "a", 0);
        let a2 = push(&mut queue, "a", 0);
        push(&mut queue, "b", 0);

        assert_eq!(queue.waiting_for(&Scope::user("a")), 2);
        queue.remove(a1);
        queue.remove(a2);
        assert_eq!(queue.waiting_for(&Scope::user("a")), 0);
        assert_eq!(queue.waiting_for(&Scope::user("b")), 1);
    }

    #[test]
    fn test_should_defer() {
        let mut queue = PriorityQueue::new(10);
        push(&mut queue, "a", 5);

        // Own entries always come first
        assert!(queue.should_defer(&Scope::user("a"), 100, false));
        // Independent caps: other subjects are not held back
        assert!(!queue.should_defer(&Scope::user("b"), 0, false));
        // Shared cap: wait behind equal or higher priority
        assert!(queue.should_defer(&Scope::user("b"), 5, true));
        assert!(!queue.should_defer(&Scope::user("b"), 6, true));
    }

    #[test]
    fn test_take_all_notifies_nothing_itself() {
        let mut queue = PriorityQueue::new(10);
        let (e1, mut r1) = entry("a", 0, 0);
        let (e2, _r2) = entry("b", 3, 0);
        queue.enqueue(e1).unwrap();
        queue.enqueue(e2).unwrap();

        let taken = queue.take_all();
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].subject, Scope::user("b"));
        assert!(queue.is_empty());
        assert_eq!(queue.waiting_for(&Scope::user("a")), 0);
        assert!(r1.try_recv().is_err());
    }

    #[test]
    fn test_entry_expiry() {
        let (tx, _rx) = oneshot::channel();
        let e = QueueEntry::new(Identity::anonymous(), 0, 100, Some(600), tx);
        assert!(!e.is_expired(599));
        assert!(e.is_expired(600));

        let (tx, _rx) = oneshot::channel();
        let e = QueueEntry::new(Identity::anonymous(), 0, 100, None, tx);
        assert!(!e.is_expired(u64::MAX));
    }

    #[test]
    fn test_resolve_returns_outcome_when_caller_gone() {
        let (e, rx) = entry("a", 0, 0);
        drop(rx);
        let back = e.resolve(QueueOutcome::Rejected(RejectReason::Timeout));
        assert!(matches!(
            back,
            Err(QueueOutcome::Rejected(RejectReason::Timeout))
        ));
    }
}
