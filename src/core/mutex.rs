//! Maekawa lock-request state machine.

use core::fmt;
use std::collections::{BTreeSet, VecDeque};

use tracing::{debug, trace};

use crate::clock::{DimensionMismatch, VectorClock};
use crate::messages::{Message, MessageKind, ProcessId};
use crate::quorum::VotingGroup;

/// Local protocol phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No request in flight.
    Idle,
    /// Votes outstanding for our own request.
    Requesting,
    /// Full quorum granted; inside the critical section.
    Holding,
}

/// The caller drove the state machine from the wrong phase. Fails fast
/// with no state mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateError {
    /// `request_lock` while a request is already in flight or held.
    NotIdle { phase: Phase },
    /// `release_lock` without holding the lock.
    NotHolding { phase: Phase },
    /// `cancel_request` with no request in flight.
    NotRequesting { phase: Phase },
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotIdle { phase } => {
                write!(f, "cannot request the lock while {phase:?}")
            }
            Self::NotHolding { phase } => {
                write!(f, "cannot release the lock while {phase:?}")
            }
            Self::NotRequesting { phase } => {
                write!(f, "no request in flight to cancel while {phase:?}")
            }
        }
    }
}

impl core::error::Error for StateError {}

/// A message the runtime must deliver to a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub to: ProcessId,
    pub message: Message,
}

/// Result of applying one event.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Step {
    /// Messages to send, in order.
    pub send: Vec<Outbound>,
    /// The Requesting → Holding transition fired during this event.
    pub acquired: bool,
}

impl Step {
    fn send_to(&mut self, to: ProcessId, kind: MessageKind, request: u64, from: &VectorClock) {
        self.send.push(Outbound {
            to,
            message: Message::new(from.owner(), kind, request, from.snapshot()),
        });
    }
}

/// One lent-out vote: which process holds it, and for which of that
/// process's requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Grant {
    holder: ProcessId,
    request: u64,
}

/// Per-process Maekawa protocol state.
///
/// Every member of a voting group is custodian of exactly one vote: once
/// `granted_to` is set, further requests queue FIFO until the matching
/// Release (or Withdraw) frees the vote. Because any two voting groups
/// intersect, no two processes can both collect a full quorum of votes.
///
/// Connections carry no ordering, so every message is tagged with the
/// sender-local request id it belongs to (the `generation` counter). A
/// custodian echoes the id in its `Ok` and matches it in `Release` and
/// `Withdraw`; a requester only counts votes that answer the request it
/// has in flight. Without the tag, a vote delayed across a withdrawal
/// would count toward the requester's *next* quorum after the custodian
/// has already reclaimed and re-lent it.
///
/// The vector clock persists across epochs ([`init_epoch`]) so causality
/// spans voting-group reconfigurations; lock state does not.
///
/// [`init_epoch`]: MutexCore::init_epoch
#[derive(Debug, Clone)]
pub struct MutexCore {
    id: ProcessId,
    group: VotingGroup,
    clock: VectorClock,
    phase: Phase,
    /// Who currently holds this node's single vote, self included.
    granted_to: Option<Grant>,
    /// Voting group members that granted our in-flight request.
    votes: BTreeSet<ProcessId>,
    /// Deferred grants, FIFO per voting member.
    queue: VecDeque<Grant>,
    /// Request id: bumped on every request/cancel/epoch, stamped on every
    /// outbound message, so stale traffic is discernible at both ends.
    generation: u64,
}

impl MutexCore {
    /// Create a core for `id` in a cluster of `num_processes`, with the
    /// trivial voting group `{id}` until [`init_epoch`](Self::init_epoch)
    /// installs a real one.
    #[must_use]
    pub fn new(id: ProcessId, num_processes: usize) -> Self {
        Self {
            id,
            group: VotingGroup::from([id]),
            clock: VectorClock::new(num_processes, id),
            phase: Phase::Idle,
            granted_to: None,
            votes: BTreeSet::new(),
            queue: VecDeque::new(),
            generation: 0,
        }
    }

    /// Install the voting group for a new epoch and reset lock state.
    ///
    /// Peers are not notified; the clock persists causally across epochs.
    pub fn init_epoch(&mut self, group: VotingGroup) {
        debug!(id = self.id, ?group, "initializing epoch");
        self.group = group;
        self.reset();
    }

    /// Reset lock state and request queue without notifying peers. Local
    /// teardown only — not part of the distributed protocol.
    pub fn reset(&mut self) {
        self.phase = Phase::Idle;
        self.granted_to = None;
        self.votes.clear();
        self.queue.clear();
        self.generation += 1;
    }

    /// Start a lock request: self-grant, then ask every other group
    /// member for its vote.
    ///
    /// If this node's vote is already lent to a peer, the node queues
    /// *itself* behind that grant instead of double-voting — the single
    /// vote per custodian is what the safety argument rests on.
    ///
    /// # Errors
    ///
    /// [`StateError::NotIdle`] if a request is already in flight or held.
    pub fn request_lock(&mut self) -> Result<Step, StateError> {
        if self.phase != Phase::Idle {
            return Err(StateError::NotIdle { phase: self.phase });
        }

        self.generation += 1;
        self.phase = Phase::Requesting;
        self.votes.clear();

        if self.granted_to.is_none() {
            self.granted_to = Some(Grant {
                holder: self.id,
                request: self.generation,
            });
            self.votes.insert(self.id);
        } else if !self.queue.iter().any(|g| g.holder == self.id) {
            trace!(id = self.id, "own vote lent out, queuing self");
            self.queue.push_back(Grant {
                holder: self.id,
                request: self.generation,
            });
        }

        self.clock.increment();
        let mut step = Step::default();
        for &member in &self.group {
            if member != self.id {
                step.send_to(member, MessageKind::Request, self.generation, &self.clock);
            }
        }

        step.acquired = self.try_acquire();
        debug!(
            id = self.id,
            votes = self.votes.len(),
            quorum = self.group.len(),
            acquired = step.acquired,
            "lock requested"
        );
        Ok(step)
    }

    /// Leave the critical section: notify the group and pass this node's
    /// own vote to the next queued requester.
    ///
    /// # Errors
    ///
    /// [`StateError::NotHolding`] if the lock is not held.
    pub fn release_lock(&mut self) -> Result<Step, StateError> {
        if self.phase != Phase::Holding {
            return Err(StateError::NotHolding { phase: self.phase });
        }

        self.clock.increment();
        let mut step = Step::default();
        for &member in &self.group {
            if member != self.id {
                step.send_to(member, MessageKind::Release, self.generation, &self.clock);
            }
        }

        // The local vote is released inline rather than looping a
        // Release through our own socket.
        self.phase = Phase::Idle;
        self.votes.clear();
        self.granted_to = None;
        self.grant_next(&mut step);
        debug!(id = self.id, "lock released");
        Ok(step)
    }

    /// Abandon an in-flight request: return to Idle, discard partial
    /// votes, and send Withdraw so peers that already granted us their
    /// vote can reclaim it. Without the withdraw those votes would dangle
    /// until this node requested again.
    ///
    /// # Errors
    ///
    /// [`StateError::NotRequesting`] if no request is in flight.
    pub fn cancel_request(&mut self) -> Result<Step, StateError> {
        if self.phase != Phase::Requesting {
            return Err(StateError::NotRequesting { phase: self.phase });
        }

        self.clock.increment();
        let mut step = Step::default();
        for &member in &self.group {
            if member != self.id {
                step.send_to(member, MessageKind::Withdraw, self.generation, &self.clock);
            }
        }

        self.phase = Phase::Idle;
        self.generation += 1;
        self.votes.clear();
        if self.granted_to.map(|g| g.holder) == Some(self.id) {
            self.granted_to = None;
            self.grant_next(&mut step);
        } else {
            self.queue.retain(|g| g.holder != self.id);
        }
        debug!(id = self.id, "request cancelled");
        Ok(step)
    }

    /// Apply one inbound message.
    ///
    /// # Errors
    ///
    /// [`DimensionMismatch`] if the clock payload has the wrong length;
    /// the message must be dropped and no state changes.
    pub fn receive(&mut self, msg: &Message) -> Result<Step, DimensionMismatch> {
        self.clock.merge(&msg.clock)?;
        trace!(id = self.id, from = msg.sender, kind = ?msg.kind, request = msg.request, "received");

        let mut step = Step::default();
        match msg.kind {
            MessageKind::Request => self.on_request(msg.sender, msg.request, &mut step),
            MessageKind::Ok => step.acquired = self.on_ok(msg.sender, msg.request),
            MessageKind::Release => self.on_release(msg.sender, msg.request, &mut step),
            MessageKind::Withdraw => self.on_withdraw(msg.sender, msg.request, &mut step),
        }
        Ok(step)
    }

    fn on_request(&mut self, requester: ProcessId, request: u64, step: &mut Step) {
        if let Some(grant) = self.granted_to {
            if grant.holder == requester {
                if grant.request == request {
                    // The vote is already theirs; the Ok may have been
                    // lost. Re-sending is idempotent since votes are
                    // matched by request id.
                    step.send_to(requester, MessageKind::Ok, request, &self.clock);
                    debug!(id = self.id, requester, "vote re-granted");
                } else {
                    // A newer request from the grantee means its granted
                    // cycle is over; the matching Release or Withdraw was
                    // overtaken on another connection. Free the vote the
                    // way that message would have.
                    debug!(id = self.id, requester, "request overtook release, freeing vote");
                    self.granted_to = None;
                    self.grant_next(step);
                    self.enqueue_or_grant(requester, request, step);
                }
                return;
            }
        }
        self.enqueue_or_grant(requester, request, step);
    }

    /// Grant the vote if it is free, else queue the requester FIFO. A
    /// queued entry from the same process is superseded in place: a newer
    /// request implies the older one was withdrawn, even if the Withdraw
    /// itself is still in flight.
    fn enqueue_or_grant(&mut self, requester: ProcessId, request: u64, step: &mut Step) {
        if self.granted_to.is_none() {
            self.granted_to = Some(Grant {
                holder: requester,
                request,
            });
            step.send_to(requester, MessageKind::Ok, request, &self.clock);
            debug!(id = self.id, requester, "vote granted");
        } else if let Some(queued) = self.queue.iter_mut().find(|g| g.holder == requester) {
            queued.request = request;
        } else {
            self.queue.push_back(Grant {
                holder: requester,
                request,
            });
            debug!(
                id = self.id,
                requester,
                depth = self.queue.len(),
                "vote busy, request queued"
            );
        }
    }

    fn on_ok(&mut self, voter: ProcessId, request: u64) -> bool {
        if self.phase != Phase::Requesting || request != self.generation {
            // A vote for a request we no longer have in flight. The voter
            // may already have reclaimed it, so counting it would let two
            // quorums complete at once.
            trace!(id = self.id, voter, request, phase = ?self.phase, "dropping stale vote");
            return false;
        }
        self.votes.insert(voter);
        debug!(
            id = self.id,
            voter,
            votes = self.votes.len(),
            quorum = self.group.len(),
            "vote received"
        );
        self.try_acquire()
    }

    fn on_release(&mut self, sender: ProcessId, request: u64, step: &mut Step) {
        // Only the exact granted request can free the vote. A stale
        // Release (reordered behind a Withdraw, or from a finished cycle)
        // must not clear a grant that belongs to someone else.
        if self.granted_to
            == Some(Grant {
                holder: sender,
                request,
            })
        {
            self.granted_to = None;
            self.grant_next(step);
        } else {
            trace!(id = self.id, sender, request, "dropping release for a grant not held");
        }
    }

    fn on_withdraw(&mut self, sender: ProcessId, request: u64, step: &mut Step) {
        if self.granted_to
            == Some(Grant {
                holder: sender,
                request,
            })
        {
            debug!(id = self.id, sender, "grantee withdrew, reclaiming vote");
            self.granted_to = None;
            self.grant_next(step);
        } else {
            self.queue
                .retain(|g| !(g.holder == sender && g.request == request));
        }
    }

    /// Hand the freed vote to the queue head, if any. A queued self is a
    /// still-pending own request, granted locally without a message.
    fn grant_next(&mut self, step: &mut Step) {
        debug_assert!(self.granted_to.is_none());
        let Some(next) = self.queue.pop_front() else {
            return;
        };
        self.granted_to = Some(next);
        if next.holder == self.id {
            self.votes.insert(self.id);
            step.acquired = self.try_acquire();
        } else {
            step.send_to(next.holder, MessageKind::Ok, next.request, &self.clock);
            debug!(id = self.id, next = next.holder, "vote granted to queued requester");
        }
    }

    fn try_acquire(&mut self) -> bool {
        if self.phase == Phase::Requesting && self.votes.len() == self.group.len() {
            self.phase = Phase::Holding;
            debug!(id = self.id, "quorum complete, entering critical section");
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn id(&self) -> ProcessId {
        self.id
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn group(&self) -> &VotingGroup {
        &self.group
    }

    #[must_use]
    pub fn votes_received(&self) -> usize {
        self.votes.len()
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Current causal timestamp, for tracing.
    #[must_use]
    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }
}
