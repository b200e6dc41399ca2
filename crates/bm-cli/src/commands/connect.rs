//! Connect command implementation

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use bm_core::config::BridgeConfig;
use bm_core::RelayTarget;
use bm_terminal::{install_panic_restore, ConsoleTerminal};

use super::build_orchestrator;
use crate::output::{print_error, print_info, print_warning};

/// Attach the controlling terminal to the host session behind `target`
/// (`[user@]relay[:ssh_port]:port`).
pub async fn connect_command(
    config: BridgeConfig,
    target: &str,
    cancel: CancellationToken,
) -> Result<()> {
    let (relay, port) = match RelayTarget::parse_connect_string(target) {
        Ok(parsed) => parsed,
        Err(e) => {
            print_error(&format!("{}", e));
            return Err(anyhow::Error::new(e));
        }
    };

    let orchestrator = build_orchestrator(config);
    let reaper = orchestrator.spawn_reaper(cancel.child_token());

    print_info(&format!(
        "Connecting to port {} on {} (Ctrl+] to detach, Ctrl+C to give up while dialing)",
        port, relay
    ));

    install_panic_restore();
    let terminal = ConsoleTerminal::attach();
    if !terminal.is_raw() {
        print_warning("Not a terminal; input is sent line by line");
    }

    // Raw mode ends when the driver drops the terminal, before Closed.
    // Dropping the dial drops the terminal too.
    let started = tokio::select! {
        started = orchestrator.start_client(relay, port, Box::new(terminal)) => started,
        _ = cancel.cancelled() => {
            orchestrator.shutdown().await;
            reaper.abort();
            print_info("Connection attempt cancelled");
            return Ok(());
        }
    };
    let session = match started {
        Ok(session) => session,
        Err(e) => {
            print_error(&format!("Failed to connect: {}", e));
            reaper.abort();
            return Err(e.into());
        }
    };
    let id = session.id().clone();

    tokio::select! {
        _ = session.wait() => {}
        _ = cancel.cancelled() => {
            orchestrator.shutdown().await;
        }
    }
    reaper.abort();

    let reason = orchestrator
        .registry()
        .get(&id)
        .ok()
        .and_then(|info| info.reason);
    match reason {
        Some(reason) => print_info(&format!("Session {} closed: {}", id, reason)),
        None => print_info(&format!("Session {} closed", id)),
    }
    Ok(())
}
