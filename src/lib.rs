//! # sitelink
//!
//! A site agent that bridges a remote task platform with a locally reachable database.
//!
//! This library provides:
//! - A long-poll client for the platform's `/listen` and `/submit-result` endpoints
//! - A task dispatch table (today: `EXECUTE_QUERY`)
//! - SQL Server, Postgres and SQLite query execution with rows returned as JSON
//! - A local control API for settings and live status
//!
//! ## Architecture
//!
//! ```text
//!   SettingsStore ──credential──▶ AgentSession ──poll──▶ RemoteChannel
//!                                      │                      │
//!                                      │ task                 │ submit-result
//!                                      ▼                      │
//!                                 TaskRegistry ──▶ QueryBackend
//!                                      │
//!                                      ▼
//!                                  EventSink ──▶ /api/events (SSE)
//! ```
//!
//! ## Task Flow
//! 1. Poll the platform (bounded, cancellable)
//! 2. Dispatch the task by its type tag
//! 3. Submit the result, best-effort
//! 4. Poll again immediately
//!
//! ## Modules
//! - `agent`: session, loop and backoff policy
//! - `remote`: platform transport
//! - `executor`: task dispatch
//! - `db`: database descriptor and drivers
//! - `settings`: persisted operator settings
//! - `events`: operator log/status broadcast

pub mod agent;
pub mod api;
pub mod config;
pub mod db;
pub mod events;
pub mod executor;
pub mod remote;
pub mod settings;
pub mod task;

pub use agent::{AgentSession, BackoffPolicy};
pub use config::Config;
