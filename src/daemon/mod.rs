//! fwdkeeper daemon - keeps a port-forwarding engine and its namespaces alive
//!
//! The daemon supervises one forwarding engine process and drives it through
//! its local control API:
//! - Engine lifecycle (spawn, health gate, crash restarts with backoff)
//! - Desired profile/namespace attachments reconciled against the engine
//! - Per-service connection status from the engine's event stream
//! - A per-project hostname suffix so instances never collide
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────┐
//! │                  fwdkeeper daemon                   │
//! ├────────────────────────────────────────────────────┤
//! │ Supervisor │ EventMonitor │ Reconciler │ IPC server │
//! │  (engine)  │  (SSE feed)  │ (profiles) │  (socket)  │
//! ├────────────────────────────────────────────────────┤
//! │        StateStore (two writers, many readers)       │
//! └────────────────────────────────────────────────────┘
//! ```
//!
//! CLI commands talk to the daemon with rkyv frames over a Unix socket. Each
//! project instance has its own socket, named after its domain suffix.

pub mod backoff;
pub mod client;
pub mod context;
pub mod control;
pub mod domain;
pub mod events;
pub mod log_buffer;
pub mod pidfile;
pub mod privilege;
pub mod protocol;
pub mod reconciler;
pub mod server;
pub mod shutdown;
pub mod state;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use backoff::{BackoffEngine, RetryPolicy, RetryState};
pub use client::DaemonClient;
pub use control::{ControlApiClient, EngineControl};
pub use domain::DomainIsolationResolver;
pub use events::EventMonitor;
pub use protocol::{Request, Response};
pub use reconciler::ProfileReconciler;
pub use server::DaemonServer;
pub use state::StateStore;
pub use supervisor::ProcessSupervisor;
