//! Core engine for timestamped HTTP traffic replay: decoding captured
//! requests, pacing their dispatch against a phase program, running them
//! through a bounded worker pool, and reporting the results.

pub mod client_pool;
pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod pace;
pub mod record;
pub mod reorder;
pub mod result_handler;
pub mod trace;
pub mod worker;

pub use client_pool::{ClientPool, ClientPoolConfig};
pub use dispatcher::{run_dispatcher, DispatcherConfig, DispatcherOutcome};
pub use error::{Error, Result};
pub use metrics::{serve_metrics, Metrics};
pub use pace::{Pacer, Phase, PhaseProgram};
pub use record::{Method, RequestRecord, ResponseInfo, ResultRecord};
pub use reorder::{Emission, ReorderBuffer};
pub use result_handler::{Outstanding, ResultHandlerConfig};
pub use trace::LogFormat;
