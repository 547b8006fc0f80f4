//! OBD-II telemetry engine.
//!
//! Architecture:
//! - Adapter task: owns the single connection to the ELM327 adapter,
//!   handles reconnection, and executes AT/OBD commands one at a time
//! - Scheduler task: walks the configured PIDs in declaration order,
//!   honors per-parameter periods, decodes replies, and keeps the
//!   parameter store's snapshot current
//! - Dispatcher task: fans snapshots out to the configured destinations
//!   (MQTT, HTTP/HTTPS, ABRP) with per-destination cadence and backoff
//!
//! The MQTT client, HTTPS client, certificate store, and expression
//! evaluator are collaborator traits in [`io`]; the engine never talks to
//! the network for publishing on its own.

pub mod abrp;
pub mod adapter;
pub mod cell;
pub mod config;
pub mod dispatch;
pub mod io;
pub mod response;
pub mod scheduler;
pub mod status;
pub mod store;
pub mod thread_util;

pub use adapter::{start_adapter_task, AdapterError, AdapterSender};
pub use cell::ProtocolCell;
pub use config::AllPids;
pub use dispatch::Dispatcher;
pub use scheduler::{start_scheduler_task, Scheduler, SchedulerDeps};
pub use status::DeviceStatus;
pub use store::ParameterStore;
