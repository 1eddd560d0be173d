//! Coordinator client library for strata replicated tables.
//!
//! This crate provides the typed surface over the hierarchical coordination
//! store that the storage layer builds on. The API surface is intentionally
//! small: a `Keeper` trait with the handful of tree operations replication
//! needs, an in-process `MemoryCoordinator` implementation, and the three
//! coordination utilities layered on top (ephemeral liveness holders, leader
//! election, abandonable block-number locks).

pub mod client;
pub mod election;
pub mod lock;
pub mod memory;

pub use client::{CreateMode, Keeper, KeeperError, KeeperResult, Op, OpResult, Stat, Watch};
pub use election::{EphemeralNodeHolder, LeaderElection};
pub use lock::{AbandonableLock, LockState};
pub use memory::{MemoryCoordinator, SessionProvider};
