//! Periodic session maintenance
//!
//! Expires disconnected sessions whose peer never came back, forces stuck
//! teardowns to `Closed` and drops closed records once they have been
//! visible long enough.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::registry::SessionRegistry;

impl SessionRegistry {
    /// Start the periodic reaper for this registry
    pub fn spawn_reaper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(run_reaper(Arc::clone(self), cancel))
    }
}

/// Run reap passes every `reap_interval` until `cancel` fires.
pub async fn run_reaper(registry: Arc<SessionRegistry>, cancel: CancellationToken) {
    let config = registry.config().clone();
    let mut interval = tokio::time::interval(config.reap_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(
        "Starting session reaper (grace period: {:?}, check interval: {:?})",
        config.reconnect_grace,
        config.reap_interval
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                registry.reap().await;
            }
            _ = cancel.cancelled() => {
                tracing::info!("Session reaper shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use bm_core::config::{PortRange, SessionConfig};
    use bm_core::{RelayTarget, Role, SessionState};

    #[test]
    fn test_default_intervals_are_reasonable() {
        let config = SessionConfig::default();
        assert!(config.reap_interval < config.reconnect_grace);
        assert!(config.reap_interval <= config.closing_timeout);
        assert!(config.reconnect_grace <= Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_expires_abandoned_session() {
        let registry = Arc::new(SessionRegistry::new(
            SessionConfig::default(),
            PortRange::default(),
        ));
        let info = registry
            .create(Role::Client, RelayTarget::new("relay.test", 22), Some(41523), None)
            .await
            .unwrap();
        registry
            .transition(&info.id, SessionState::Connected, None)
            .await
            .unwrap();
        registry
            .transition(&info.id, SessionState::Disconnected, None)
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let task = registry.spawn_reaper(cancel.clone());

        tokio::time::sleep(Duration::from_secs(36)).await;
        assert_eq!(registry.get(&info.id).unwrap().state, SessionState::Closed);

        cancel.cancel();
        task.await.unwrap();
    }
}
