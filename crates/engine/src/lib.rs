//! tracefork engine - transaction replay, multi-backend tracing and path analysis

pub mod analyzer;
pub use analyzer::*;

pub mod config;
pub use config::*;

pub mod core;
pub use core::*;

pub mod deadline;
pub use deadline::*;

pub mod dual_mode;
pub use dual_mode::*;

pub mod error;
pub use error::*;

pub mod hooks;
pub use hooks::*;

pub mod node;
pub use node::*;

pub mod prestate;
pub use prestate::*;

pub mod snapshot;
pub use snapshot::*;

pub mod tracer;
pub use tracer::*;
