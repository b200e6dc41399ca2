//! Status command implementation

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::control::ControlClient;
use crate::output::{format_event, format_sessions, print_error, print_warning};

/// Print the sessions of the running host process; with `watch`, keep
/// printing state changes until interrupted.
pub async fn status_command(address: &str, watch: bool, cancel: CancellationToken) -> Result<()> {
    let mut client = match ControlClient::connect(address).await {
        Ok(client) => client,
        Err(e) => {
            print_error(&format!("{}", e));
            return Err(e);
        }
    };

    if !watch {
        let sessions = client.list_sessions().await?;
        println!("{}", format_sessions(&sessions));
        return Ok(());
    }

    let sessions = client.watch().await?;
    println!("{}", format_sessions(&sessions));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = client.next_event() => match event? {
                Some(event) => println!("{}", format_event(&event)),
                None => {
                    print_warning("Host process went away");
                    break;
                }
            },
        }
    }

    Ok(())
}
