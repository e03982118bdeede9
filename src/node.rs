//! Async runtime for one Maekawa process.
//!
//! [`MutexNode`] wraps the pure [`MutexCore`] with the concurrency and
//! transport discipline the protocol needs: a listener that dispatches
//! each inbound connection to its own task, retry-with-backoff on sends,
//! and a single well-defined suspension point for "wait for quorum".
//!
//! All protocol state lives behind one mutex; inbound handlers and the
//! caller-facing API both funnel through it, so vote counting can never
//! race. Phase changes are published on a watch channel tagged with the
//! request generation — that is what `lock()` suspends on, and what lets
//! it tell a fresh grant apart from a stale one after a cancel.

use core::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use error_stack::Report;
use futures::{SinkExt, Stream, StreamExt};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;
use tracing::{debug, instrument, trace, warn};

use crate::clock::VectorClock;
use crate::codec::MessageCodec;
use crate::config::{NodeConfig, Sleep, TokioSleep};
use crate::connector::{ConnectError, Connector};
use crate::core::{MutexCore, Outbound, Phase, StateError};
use crate::messages::{Message, ProcessId};
use crate::quorum::VotingGroup;

/// A lock acquisition failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// Quorum not reached within the caller's deadline. Recoverable: the
    /// node is back to Idle and the caller may retry.
    Timeout,
    /// A voting group member stayed unreachable through every send
    /// attempt. With no leader to route around, an unreachable member
    /// blocks acquisition outright — surfaced instead of hanging forever.
    QuorumUnreachable,
    /// Called from the wrong phase; nothing was mutated.
    State(StateError),
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("quorum not reached before the deadline"),
            Self::QuorumUnreachable => f.write_str("voting group member unreachable"),
            Self::State(e) => e.fmt(f),
        }
    }
}

impl core::error::Error for LockError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            Self::State(e) => Some(e),
            Self::Timeout | Self::QuorumUnreachable => None,
        }
    }
}

/// Snapshot published on every state change, watched by `lock()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PhaseView {
    generation: u64,
    phase: Phase,
}

struct Shared<C, S> {
    id: ProcessId,
    /// Listening address per process, indexed by [`ProcessId`].
    addrs: Vec<SocketAddr>,
    /// The single serialization point for all protocol state.
    core: Mutex<MutexCore>,
    phase_tx: watch::Sender<PhaseView>,
    shutdown_tx: watch::Sender<bool>,
    connector: C,
    sleep: S,
    config: NodeConfig,
    /// Jitter source for send backoff.
    rng: Mutex<StdRng>,
}

/// One process participating in Maekawa mutual exclusion.
///
/// Cheap to clone; all clones share the same protocol state. Methods that
/// send messages spawn onto the ambient tokio runtime.
pub struct MutexNode<C: Connector, S: Sleep = TokioSleep> {
    shared: Arc<Shared<C, S>>,
}

impl<C: Connector, S: Sleep> Clone for MutexNode<C, S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Connector> MutexNode<C, TokioSleep> {
    /// Create a node for process `id` with the cluster address table.
    ///
    /// The listener is not started; spawn [`listen`](Self::listen) for
    /// that. Until [`init_epoch`](Self::init_epoch) the voting group is
    /// the trivial `{id}`.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not an index into `addrs`.
    #[must_use]
    pub fn new(id: ProcessId, addrs: Vec<SocketAddr>, connector: C, config: NodeConfig) -> Self {
        Self::with_sleep(id, addrs, connector, config, TokioSleep)
    }
}

impl<C: Connector, S: Sleep> MutexNode<C, S> {
    /// Like [`MutexNode::new`] with a custom [`Sleep`] (for simulated
    /// runtimes).
    ///
    /// # Panics
    ///
    /// Panics if `id` is not an index into `addrs`.
    #[must_use]
    pub fn with_sleep(
        id: ProcessId,
        addrs: Vec<SocketAddr>,
        connector: C,
        config: NodeConfig,
        sleep: S,
    ) -> Self {
        assert!(
            (id as usize) < addrs.len(),
            "process id {id} out of range for {} addresses",
            addrs.len()
        );
        let core = MutexCore::new(id, addrs.len());
        let (phase_tx, _) = watch::channel(PhaseView {
            generation: core.generation(),
            phase: core.phase(),
        });
        let (shutdown_tx, _) = watch::channel(false);
        let rng = StdRng::seed_from_u64(config.rng_seed);
        Self {
            shared: Arc::new(Shared {
                id,
                addrs,
                core: Mutex::new(core),
                phase_tx,
                shutdown_tx,
                connector,
                sleep,
                config,
                rng: Mutex::new(rng),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> ProcessId {
        self.shared.id
    }

    /// Current protocol phase, for observability.
    #[must_use]
    pub fn phase(&self) -> Phase {
        self.lock_core().phase()
    }

    /// Snapshot of the causal clock, for tracing.
    #[must_use]
    pub fn clock(&self) -> VectorClock {
        self.lock_core().clock().clone()
    }

    /// Number of deferred grants queued behind this node's vote.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.lock_core().queue_len()
    }

    /// Install the voting group for a new epoch, resetting lock state.
    /// The vector clock persists across epochs.
    pub fn init_epoch(&self, group: VotingGroup) {
        let mut core = self.lock_core();
        core.init_epoch(group);
        self.publish(&core);
    }

    /// Reset lock state and request queue without notifying peers.
    pub fn cleanup(&self) {
        let mut core = self.lock_core();
        core.reset();
        self.publish(&core);
    }

    /// Acquire the distributed lock, waiting indefinitely for quorum.
    ///
    /// # Errors
    ///
    /// [`LockError::State`] if a request is already in flight or held;
    /// [`LockError::QuorumUnreachable`] if a group member stayed
    /// unreachable through every retry (the request is withdrawn).
    pub async fn lock(&self) -> Result<(), Report<LockError>> {
        self.lock_inner(None).await
    }

    /// Acquire the distributed lock or give up after `timeout`.
    ///
    /// On timeout the request is withdrawn (peers that already granted
    /// their vote are told to reclaim it) and the node returns to Idle,
    /// so the caller may simply retry.
    ///
    /// # Errors
    ///
    /// As [`lock`](Self::lock), plus [`LockError::Timeout`].
    pub async fn lock_timeout(&self, timeout: Duration) -> Result<(), Report<LockError>> {
        self.lock_inner(Some(timeout)).await
    }

    #[instrument(skip_all, fields(id = self.shared.id, ?timeout))]
    async fn lock_inner(&self, timeout: Option<Duration>) -> Result<(), Report<LockError>> {
        let mut phase_rx = self.shared.phase_tx.subscribe();

        let (step, generation) = {
            let mut core = self.lock_core();
            let step = core
                .request_lock()
                .map_err(|e| Report::new(LockError::State(e)))?;
            self.publish(&core);
            (step, core.generation())
        };

        if step.acquired {
            debug!("acquired via self-vote alone");
            return Ok(());
        }

        // Deliver the requests concurrently with the wait; every group
        // member is required for quorum, so one definitive delivery
        // failure fails the whole acquisition.
        let (fail_tx, mut fail_rx) = mpsc::channel::<Report<ConnectError>>(step.send.len().max(1));
        for out in step.send {
            let node = self.clone();
            let fail_tx = fail_tx.clone();
            tokio::spawn(async move {
                if let Err(report) = node.send_with_retry(&out).await {
                    let _ = fail_tx.send(report).await;
                }
            });
        }
        drop(fail_tx);

        let held = phase_rx.wait_for(|v| v.generation == generation && v.phase == Phase::Holding);
        let failure = if let Some(t) = timeout {
            tokio::select! {
                res = held => match res {
                    Ok(_) => None,
                    Err(_) => return Err(Report::new(LockError::QuorumUnreachable)
                        .attach("node shut down while waiting for quorum")),
                },
                Some(report) = fail_rx.recv() => {
                    Some(report.change_context(LockError::QuorumUnreachable))
                }
                () = self.shared.sleep.sleep(t) => Some(Report::new(LockError::Timeout)),
            }
        } else {
            tokio::select! {
                res = held => match res {
                    Ok(_) => None,
                    Err(_) => return Err(Report::new(LockError::QuorumUnreachable)
                        .attach("node shut down while waiting for quorum")),
                },
                Some(report) = fail_rx.recv() => {
                    Some(report.change_context(LockError::QuorumUnreachable))
                }
            }
        };

        match failure {
            None => {
                debug!("lock acquired");
                Ok(())
            }
            Some(report) => {
                // Quorum may have completed in the race window before we
                // took the state lock back; prefer the successful result.
                if self.withdraw_request(generation) {
                    debug!("quorum completed while giving up");
                    return Ok(());
                }
                Err(report)
            }
        }
    }

    /// Explicitly abandon an in-flight request: back to Idle, partial
    /// votes discarded, Withdraw multicast so no peer vote dangles. Late
    /// OKs for the abandoned request are recognized as stale and dropped.
    ///
    /// # Errors
    ///
    /// [`StateError::NotRequesting`] if there is nothing to cancel.
    pub fn cancel(&self) -> Result<(), Report<StateError>> {
        let step = {
            let mut core = self.lock_core();
            let step = core.cancel_request().map_err(Report::new)?;
            self.publish(&core);
            step
        };
        self.spawn_sends(step.send);
        Ok(())
    }

    /// Leave the critical section: multicast Release to the voting group
    /// and pass this node's own vote to the next queued requester.
    ///
    /// Release delivery failures are retried with backoff and otherwise
    /// logged, not surfaced — the local lock state is already released.
    ///
    /// # Errors
    ///
    /// [`StateError::NotHolding`] if the lock is not held; no state is
    /// mutated.
    pub fn unlock(&self) -> Result<(), Report<StateError>> {
        let step = {
            let mut core = self.lock_core();
            let step = core.release_lock().map_err(Report::new)?;
            self.publish(&core);
            step
        };
        self.spawn_sends(step.send);
        Ok(())
    }

    /// Apply one inbound message and send whatever the protocol demands
    /// in response. Malformed clocks are logged and dropped; protocol
    /// state is untouched.
    pub fn deliver(&self, msg: &Message) {
        let step = {
            let mut core = self.lock_core();
            match core.receive(msg) {
                Ok(step) => {
                    self.publish(&core);
                    step
                }
                Err(e) => {
                    warn!(sender = msg.sender, %e, "dropping message");
                    return;
                }
            }
        };
        self.spawn_sends(step.send);
    }

    /// Drain one inbound connection, delivering each decoded message.
    /// A decode error drops the rest of the connection but never the
    /// process.
    pub async fn serve_connection<T>(&self, mut stream: T)
    where
        T: Stream<Item = Result<Message, io::Error>> + Unpin,
    {
        while let Some(next) = stream.next().await {
            match next {
                Ok(msg) => self.deliver(&msg),
                Err(e) => {
                    warn!(error = %e, "failed to decode inbound message");
                    return;
                }
            }
        }
    }

    /// Bind this process's listening address and dispatch inbound
    /// connections until [`shutdown`](Self::shutdown). Each accepted
    /// connection is handled on its own task.
    ///
    /// # Errors
    ///
    /// Propagates bind/accept I/O errors.
    #[instrument(skip_all, fields(id = self.shared.id))]
    pub async fn listen(&self) -> io::Result<()> {
        let addr = self.shared.addrs[self.shared.id as usize];
        let listener = TcpListener::bind(addr).await?;
        debug!(%addr, "listening");

        let mut shutdown_rx = self.shared.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    trace!(%peer, "inbound connection");
                    let node = self.clone();
                    tokio::spawn(async move {
                        node.serve_connection(Framed::new(stream, MessageCodec::new()))
                            .await;
                    });
                }
                _ = shutdown_rx.wait_for(|stop| *stop) => {
                    debug!("listener stopped");
                    return Ok(());
                }
            }
        }
    }

    /// Stop the listener and release any waiter. Local only; peers are
    /// not notified.
    pub fn shutdown(&self) {
        debug!(id = self.shared.id, "shutting down");
        self.shared.shutdown_tx.send_replace(true);
    }

    /// Withdraw the request for `generation` if it is still in flight.
    /// Returns true if it had already reached Holding instead.
    fn withdraw_request(&self, generation: u64) -> bool {
        let step = {
            let mut core = self.lock_core();
            if core.generation() != generation {
                return false;
            }
            if core.phase() == Phase::Holding {
                return true;
            }
            let Ok(step) = core.cancel_request() else {
                return false;
            };
            self.publish(&core);
            step
        };
        self.spawn_sends(step.send);
        false
    }

    fn spawn_sends(&self, outbound: Vec<Outbound>) {
        for out in outbound {
            let node = self.clone();
            tokio::spawn(async move {
                if let Err(report) = node.send_with_retry(&out).await {
                    warn!(to = out.to, error = ?report, "message delivery failed");
                }
            });
        }
    }

    /// One fresh connection per attempt: connect, write one frame, close.
    async fn send_with_retry(&self, out: &Outbound) -> Result<(), Report<ConnectError>> {
        let addr = self.shared.addrs[out.to as usize];
        let mut connector = self.shared.connector.clone();

        let mut last: Option<Report<ConnectError>> = None;
        for attempt in 0..self.shared.config.max_send_attempts {
            if attempt > 0 {
                let backoff = {
                    let mut rng = self.shared.rng.lock().expect("rng lock poisoned");
                    self.shared.config.backoff.duration(attempt - 1, &mut *rng)
                };
                trace!(to = out.to, attempt, ?backoff, "backing off before resend");
                self.shared.sleep.sleep(backoff).await;
            }

            match connector.connect(&addr).await {
                Ok(mut conn) => match conn.send(out.message.clone()).await {
                    Ok(()) => {
                        let _ = conn.close().await;
                        trace!(to = out.to, kind = ?out.message.kind, "sent");
                        return Ok(());
                    }
                    Err(e) => last = Some(Report::new(e).change_context(ConnectError)),
                },
                Err(e) => last = Some(Report::new(e).change_context(ConnectError)),
            }
        }

        let report = last.unwrap_or_else(|| Report::new(ConnectError));
        Err(report.attach(format!(
            "gave up on peer {} ({addr}) after {} attempts",
            out.to, self.shared.config.max_send_attempts
        )))
    }

    fn lock_core(&self) -> std::sync::MutexGuard<'_, MutexCore> {
        self.shared.core.lock().expect("protocol state lock poisoned")
    }

    fn publish(&self, core: &MutexCore) {
        self.shared.phase_tx.send_replace(PhaseView {
            generation: core.generation(),
            phase: core.phase(),
        });
    }
}
