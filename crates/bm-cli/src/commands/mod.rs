//! CLI command implementations

mod close;
mod connect;
mod host;
mod status;

pub use close::close_command;
pub use connect::connect_command;
pub use host::host_command;
pub use status::status_command;

use std::sync::Arc;

use bm_core::config::BridgeConfig;
use bm_relay::{RelayOrchestrator, SshTransport};
use bm_terminal::NativeShellLauncher;

/// Orchestrator wired to the real SSH transport and local shells
fn build_orchestrator(config: BridgeConfig) -> RelayOrchestrator {
    let transport = Arc::new(SshTransport::new(config.relay.clone()));
    let env = config
        .shell
        .env
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let launcher = Arc::new(NativeShellLauncher::new(config.shell.program.clone(), env));
    RelayOrchestrator::new(config, transport, launcher)
}
