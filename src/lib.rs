//! Maekawa's quorum-based distributed mutual exclusion.
//!
//! N peer processes coordinate exclusive access to a shared critical
//! section with no central coordinator. Each process exchanges votes only
//! within its small voting group (quorum) rather than with all N-1 peers,
//! so a lock/unlock cycle costs O(√N) messages. Safety comes from the
//! quorum intersection property: any two voting groups share at least one
//! member, and each member lends out its single vote to at most one
//! requester at a time, so two processes can never both assemble a full
//! quorum.
//!
//! # Architecture
//!
//! - [`quorum::voting_groups`]: grid quorum construction
//! - [`clock::VectorClock`]: causal timestamps for tracing/debugging
//! - [`core::MutexCore`]: pure protocol state machine, no I/O
//! - [`node::MutexNode`]: async runtime — listener, suspension, retries
//!
//! # Quick start
//!
//! ```ignore
//! use maekawa::{MutexNode, NodeConfig, TcpConnector, voting_groups};
//!
//! let groups = voting_groups(addrs.len())?;
//! let node = MutexNode::new(id, addrs, TcpConnector::new(), NodeConfig::default());
//! tokio::spawn({
//!     let node = node.clone();
//!     async move { node.listen().await }
//! });
//! node.init_epoch(groups[id as usize].clone());
//!
//! node.lock_timeout(Duration::from_secs(5)).await?;
//! // critical section
//! node.unlock()?;
//! ```

#![warn(clippy::pedantic)]

pub mod clock;
pub mod codec;
pub mod config;
pub mod connector;
pub mod core;
pub mod messages;
pub mod node;
pub mod quorum;

pub use clock::{DimensionMismatch, VectorClock};
pub use codec::MessageCodec;
pub use config::{BackoffConfig, NodeConfig, Sleep, TokioSleep};
pub use connector::{ConnectError, Connector, TcpConnector};
pub use crate::core::{MutexCore, Phase, StateError};
pub use messages::{Message, MessageKind, ProcessId};
pub use node::{LockError, MutexNode};
pub use quorum::{InvalidProcessCount, VotingGroup, voting_groups};
