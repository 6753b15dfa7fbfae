pub mod agent_engine;
pub mod config;
pub mod errors;
pub mod executor;
pub mod llm;
pub mod perception;

pub use agent_engine::engine::{AgentHandle, GuiAgent};
pub use agent_engine::event_bus::{EventBus, RunEvent};
pub use agent_engine::state::RunStatus;
pub use errors::{PilotError, PilotResult};

/// Install the global `tracing` subscriber (`RUST_LOG`, default `info`).
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}
