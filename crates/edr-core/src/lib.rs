//! EDR agent core library.
//!
//! - Probes sampling processes, network connections and files
//! - Normalization into the canonical event schema
//! - Connection management and the spool-draining sender
//! - The collector runtime and agent assembly
//!
//! The binary entry point is in `main.rs`.

pub mod agent;
pub mod connection;
pub mod exit_codes;
pub mod hash;
pub mod host;
pub mod logging;
pub mod normalize;
pub mod probe;
pub mod runtime;
pub mod sender;
pub mod signal;

pub use agent::{Agent, AgentError};
pub use connection::{ConnectionManager, ConnectionState, SendError};
pub use normalize::Normalizer;
pub use runtime::CollectorRuntime;
pub use sender::{drain_pass, DrainReport, DrainStop, Sender};
