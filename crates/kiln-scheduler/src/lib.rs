//! Kiln scheduler - coordinator for a distributed compile cluster.
//!
//! The scheduler is responsible for:
//!
//! - **Worker registration**: tracking connected workers, their slots, load
//!   and the toolchain environments they hold
//! - **Job dispatch**: picking a worker for each compile request, honouring
//!   environment compatibility and worker affinity
//! - **Environment distribution**: receiving toolchain archives from
//!   requesters, caching them under a size budget, and pushing them to
//!   workers that lack them
//! - **Monitoring**: streaming lifecycle events to monitors and serving an
//!   authenticated administrative channel
//!
//! # Architecture
//!
//! All cluster state lives in one [`Scheduler`] task. WebSocket connections
//! ([`connection`]) and HTTP handlers ([`api`]) talk to it through a
//! [`SchedulerHandle`], and it answers through each connection's bounded
//! outbound queue ([`peer::Peer`]).
//!
//! # Example
//!
//! ```ignore
//! use kiln_scheduler::{Scheduler, SchedulerConfig};
//!
//! let config = SchedulerConfig::load(None)?;
//! let (scheduler, handle) = Scheduler::bootstrap(&config, kv).await?;
//! tokio::spawn(scheduler.run(shutdown));
//! ```

pub mod api;
pub mod auth;
pub mod compat;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod environments;
pub mod error;
pub mod eviction;
pub mod monitor;
pub mod outbox;
pub mod peer;
pub mod placement;
pub mod registry;
pub mod scheduler;
pub mod sync;

pub use auth::{AuthError, Session, UserStore};
pub use compat::CompatibilityGraph;
pub use config::SchedulerConfig;
pub use environments::{EnvironmentStore, StoredEnvironment};
pub use error::{Result, SchedulerError};
pub use eviction::EvictionPolicy;
pub use peer::{ConnectionId, Outbound, Peer};
pub use placement::{CapacityScore, PlacementAlgorithm, PlacementRequest};
pub use registry::{WorkerInfo, WorkerKey, WorkerRegistration, WorkerRegistry};
pub use scheduler::{ClusterInfo, Command, EnvironmentInventory, Scheduler, SchedulerHandle};
