//! Protocol messages exchanged between voting group members.

use serde::{Deserialize, Serialize};

/// Identifies a process and its slot in the address table. Dense in `[0, N)`.
pub type ProcessId = u32;

/// Message kind. The three-way REQUEST/OK/RELEASE exchange of Maekawa's
/// protocol, plus `Withdraw` for reclaiming a vote after a timed-out or
/// cancelled request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Ask a voting group member for its vote.
    Request,
    /// Grant a vote to a requester.
    Ok,
    /// The sender left its critical section; the vote it held is free.
    Release,
    /// The sender abandoned an in-flight request; free or dequeue its claim.
    Withdraw,
}

/// One framed protocol message.
///
/// The clock snapshot is pure causal bookkeeping: protocol safety comes
/// from quorum voting, not from clock ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Originating process.
    pub sender: ProcessId,
    /// What the sender wants.
    pub kind: MessageKind,
    /// The sender-local lock request this message starts, answers or
    /// retires. Connections carry no ordering, so votes and releases are
    /// matched against this id rather than assumed to be current.
    pub request: u64,
    /// Sender's vector clock at send time, length N.
    pub clock: Vec<u64>,
}

impl Message {
    #[must_use]
    pub fn new(sender: ProcessId, kind: MessageKind, request: u64, clock: Vec<u64>) -> Self {
        Self {
            sender,
            kind,
            request,
            clock,
        }
    }
}
