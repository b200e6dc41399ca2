//! Host command implementation

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use bm_core::config::BridgeConfig;
use bm_core::ipc::ControlEvent;
use bm_core::{RelayTarget, SessionState};
use bm_relay::{ControlServer, SessionEvent};

use super::build_orchestrator;
use crate::output::{format_event, print_error, print_info, print_success, print_warning};

/// Share the local shell through `destination` until the session closes or
/// `cancel` fires.
pub async fn host_command(
    config: BridgeConfig,
    destination: &str,
    port: Option<u16>,
    cancel: CancellationToken,
) -> Result<()> {
    let relay: RelayTarget = match destination.parse() {
        Ok(relay) => relay,
        Err(e) => {
            print_error(&format!("{}", e));
            return Err(anyhow::Error::new(e));
        }
    };

    let control = config.control.clone();
    let orchestrator = build_orchestrator(config);
    let services = cancel.child_token();
    let reaper = orchestrator.spawn_reaper(services.clone());

    if control.enabled {
        let address = control.address();
        match ControlServer::bind(&address, Arc::clone(orchestrator.registry())).await {
            Ok(server) => {
                tokio::spawn(server.run(services.clone()));
            }
            Err(e) => {
                print_warning(&format!(
                    "Control endpoint unavailable, status and close will not see this host: {}",
                    e
                ));
            }
        }
    }

    let mut events = orchestrator.subscribe();

    print_info(&format!("Binding a tunnel port on {}...", relay));
    let session = tokio::select! {
        result = orchestrator.start_host(relay, port) => match result {
            Ok(session) => session,
            Err(e) => {
                print_error(&format!("Failed to start hosting: {}", e));
                services.cancel();
                let _ = reaper.await;
                return Err(e.into());
            }
        },
        _ = cancel.cancelled() => {
            orchestrator.shutdown().await;
            services.cancel();
            let _ = reaper.await;
            return Ok(());
        }
    };

    let id = session.id().clone();
    print_success(&format!(
        "Session {} listening on relay port {}",
        id,
        session.tunnel_port()
    ));
    println!();
    println!("  On the other machine, run:");
    println!();
    println!("    bridgeme connect {}", session.connect_string());
    println!();
    print_info("Press Ctrl+C to stop hosting");

    let mut reason = None;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Stopping host session {}", id);
                break;
            }
            event = events.recv() => match event {
                Ok(event) if event.session_id() == &id => {
                    if let SessionEvent::StateChanged { to, reason: why, .. } = &event {
                        if why.is_some() {
                            reason = why.clone();
                        }
                        if *to == SessionState::Closed {
                            break;
                        }
                    }
                    println!("{}", format_event(&ControlEvent::from(event)));
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => {
                    tracing::debug!("Missed {} session event(s)", n);
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    orchestrator.shutdown().await;
    session.wait().await;
    services.cancel();
    let _ = reaper.await;

    match reason {
        Some(reason) => print_info(&format!("Session {} closed: {}", id, reason)),
        None => print_info(&format!("Session {} closed", id)),
    }
    Ok(())
}
