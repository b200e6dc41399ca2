//! Close command implementation

use anyhow::Result;

use bm_core::SessionId;

use crate::control::ControlClient;
use crate::output::{print_error, print_success, print_warning};

/// Close one session by id, or every session with `all`
pub async fn close_command(address: &str, id: Option<&str>, all: bool) -> Result<()> {
    let mut client = match ControlClient::connect(address).await {
        Ok(client) => client,
        Err(e) => {
            print_error(&format!("{}", e));
            return Err(e);
        }
    };

    let result = match (id, all) {
        (_, true) => client.close_all().await,
        (Some(id), false) => client.close_session(SessionId::from(id)).await,
        (None, false) => anyhow::bail!("Specify a session id or --all"),
    };

    match result {
        Ok(0) if all => print_warning("No open sessions"),
        Ok(0) => print_warning("Session is already closing"),
        Ok(1) => print_success("Closed 1 session"),
        Ok(count) => print_success(&format!("Closed {} sessions", count)),
        Err(e) => {
            print_error(&format!("Failed to close: {}", e));
            return Err(e);
        }
    }
    Ok(())
}
