//! Supervision core for concurrent AI coding-agent runs.
//!
//! `warden` manages the subprocess lifecycle of external coding agents,
//! normalizes their line-delimited JSON output into one event model, tracks
//! token and dollar cost against configurable ceilings, keeps bounded
//! in-memory log buffers per run, and persists enough state to survive a
//! supervisor restart — including reattaching to subprocesses that kept
//! running while it was away.
//!
//! The embedding host (a terminal UI, typically) owns rendering and input;
//! it observes this core through [`store::RunStore`] subscriptions and the
//! [`sink::RunSink`] trait, and drives it through [`manager::Manager`].

pub mod buffer;
pub mod config;
pub mod cost;
pub mod event;
pub mod follow;
pub mod manager;
pub mod protocol;
pub mod run;
pub mod runtime;
pub mod session;
pub mod sink;
pub mod store;

/// Install a stderr `tracing` subscriber filtered by `RUST_LOG` (default
/// `warn`). Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
