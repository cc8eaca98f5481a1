#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod core;
mod engine;
mod error;
mod registry;
mod resource;
mod task;
#[cfg(feature = "live")]
pub mod watch;

pub use crate::core::{Hash32, Payload};
pub use crate::engine::{
    CancelHandle, Dependency, Diagnostics, EngineBuilder, EngineHandle, ExecContext, Session,
    TaskExecution, TraceRecord, TraceStore, Workbench,
};
pub use crate::error::*;
pub use crate::registry::TaskRegistry;
pub use crate::resource::{
    Content, FsResolver, MemoryResolver, ResolverChain, ResolverChainBuilder, Resolver,
    ResourceKey, Stamp, StampKind,
};
pub use crate::task::{FnTask, TaskDef, TaskId};

/// Installs a `tracing` subscriber printing to stderr, filtered through
/// `RUST_LOG` and defaulting to `info`.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();
}
