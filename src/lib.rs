///
/// Notifyable cache and factory: object interning, materialization, the
/// ready protocol, and the synchronize barrier.
///
pub mod cache;

///
/// Configuration values for the repository connection, RPC managers, and
/// health checkers.
///
pub mod config;

///
/// Sequence-node leader election per group.
///
pub mod election;

///
/// Failure taxonomy.
///
pub mod error;

///
/// User-visible events and the change-handler classification.
///
pub mod event;

///
/// Periodic health checking bound to a node.
///
pub mod health;

///
/// Caller identity and time helpers.
///
pub mod ids;

///
/// Bidirectional mapping between notifyable identity and repository paths.
///
pub mod key;

///
/// Distributed advisory locks over ephemeral-sequential bids.
///
pub mod lock;

///
/// The notifyable record and its kind-gated operations.
///
pub mod notifyable;

///
/// Repository-backed FIFO queues.
///
pub mod queue;

///
/// The repository seam: the storage contract, the in-process store, and
/// the session/watch adapter.
///
pub mod repository;

///
/// JSON-RPC 1.0 request/response fabric over repository queues.
///
pub mod rpc;

///
/// Keyed rendezvous and delayed alarms.
///
pub mod sync;

pub use {
    cache::Factory,
    config::{HealthCheckerConfig, RepositoryConfig, RpcManagerConfig},
    error::{Error, Result},
    event::{NotifyableEvent, UserEventHandler, UserEventPayload},
    health::{HealthChecker, HealthReport, HealthState},
    key::NotifyableKind,
    lock::{DistributedLockMode, LockInfo},
    notifyable::{Notifyable, NotifyableState},
    repository::{MemoryStorage, RepositoryAdapter, Storage},
    rpc::{JsonRpcResponseHandler, RpcManager, RpcMethod, RpcRequest},
};

/// Version of a repository znode or cached document.
pub type Version = i32;

/// Sequence number assigned by the repository to a sequential node.
pub type SequenceNumber = i64;
