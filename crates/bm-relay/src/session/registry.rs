//! Session registry
//!
//! The registry is the single owner of session records. Drivers claim the
//! session they run and report state changes through [`SessionRegistry::transition`];
//! `status` and `close` read and act through the same value.
//!
//! # Atomicity Model
//!
//! Records live in a `DashMap` so snapshots never block. Every compound
//! read-modify-write (creation with id and port selection, close, reap, port
//! reassignment, transitions) additionally holds `write_lock`, so two
//! creations can never pick the same id or port and a close can never race a
//! reap into releasing a session twice.

use std::collections::HashSet;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use bm_core::config::{PortRange, SessionConfig};
use bm_core::time::current_time_millis;
use bm_core::{RelayTarget, Role, SessionError, SessionId, SessionInfo, SessionState, ShellKind};

use super::allocator::PortAllocator;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Which sessions a close request applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseTarget {
    One(SessionId),
    All,
}

/// Registry change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Created(SessionInfo),
    StateChanged {
        id: SessionId,
        from: SessionState,
        to: SessionState,
        reason: Option<String>,
    },
    Removed {
        id: SessionId,
    },
}

impl SessionEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            SessionEvent::Created(info) => &info.id,
            SessionEvent::StateChanged { id, .. } | SessionEvent::Removed { id } => id,
        }
    }
}

/// Outcome of one reap pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapStats {
    /// Disconnected sessions whose grace period ran out
    pub expired: usize,
    /// Closing sessions forced to Closed
    pub forced: usize,
    /// Closed sessions dropped from the registry
    pub removed: usize,
}

struct SessionEntry {
    info: SessionInfo,
    /// Cancellation handle of the driver that owns this session
    claim: Option<CancellationToken>,
    state_since: Instant,
}

/// Process-wide table of sessions
pub struct SessionRegistry {
    config: SessionConfig,
    allocator: PortAllocator,
    write_lock: Mutex<()>,
    sessions: DashMap<SessionId, SessionEntry>,
    events: broadcast::Sender<SessionEvent>,
    closed: Notify,
}

impl SessionRegistry {
    pub fn new(config: SessionConfig, ports: PortRange) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            allocator: PortAllocator::new(ports),
            write_lock: Mutex::new(()),
            sessions: DashMap::new(),
            events,
            closed: Notify::new(),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Subscribe to registry changes
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Register a new session in `Pending`.
    ///
    /// Hosts get a freshly allocated relay port; clients record the port they
    /// dial, which must not be held by another live session.
    pub async fn create(
        &self,
        role: Role,
        relay: RelayTarget,
        port: Option<u16>,
        shell: Option<ShellKind>,
    ) -> Result<SessionInfo, SessionError> {
        let _lock = self.write_lock.lock().await;

        let in_use = self.ports_in_use();
        let tunnel_port = match (role, port) {
            (_, Some(port)) => {
                if in_use.contains(&port) {
                    return Err(SessionError::PortInUse(port));
                }
                port
            }
            (Role::Host, None) => self.allocator.allocate(&in_use)?,
            (Role::Client, None) => {
                return Err(SessionError::PortAllocationFailed { attempts: 0 });
            }
        };

        let id = loop {
            let candidate = SessionId::generate();
            if !self.sessions.contains_key(&candidate) {
                break candidate;
            }
        };

        let now = current_time_millis();
        let info = SessionInfo {
            id: id.clone(),
            role,
            relay,
            tunnel_port,
            state: SessionState::Pending,
            created_at: now,
            last_activity_at: now,
            shell,
            reason: None,
            reconnects: 0,
        };

        self.sessions.insert(
            id.clone(),
            SessionEntry {
                info: info.clone(),
                claim: None,
                state_since: Instant::now(),
            },
        );

        tracing::info!(session = %id, %role, port = tunnel_port, "Session created");
        let _ = self.events.send(SessionEvent::Created(info.clone()));
        Ok(info)
    }

    /// Snapshot of one session
    pub fn get(&self, id: &SessionId) -> Result<SessionInfo, SessionError> {
        self.sessions
            .get(id)
            .map(|entry| entry.info.clone())
            .ok_or_else(|| SessionError::NotFound(id.clone()))
    }

    /// Snapshots of all sessions, oldest first
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|entry| entry.info.clone())
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Ports held by sessions that are not yet `Closed`
    pub fn ports_in_use(&self) -> HashSet<u16> {
        self.sessions
            .iter()
            .filter(|entry| !entry.info.state.is_closed())
            .map(|entry| entry.info.tunnel_port)
            .collect()
    }

    /// Take ownership of a session's lifecycle.
    ///
    /// The returned token is cancelled when the session is closed from
    /// outside (user, control request, reaper).
    pub async fn claim(&self, id: &SessionId) -> Result<CancellationToken, SessionError> {
        let _lock = self.write_lock.lock().await;
        let mut entry = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.clone()))?;
        if entry.info.state.is_terminating() {
            return Err(SessionError::NotFound(id.clone()));
        }
        if entry.claim.is_some() {
            return Err(SessionError::AlreadyClaimed(id.clone()));
        }
        let token = CancellationToken::new();
        entry.claim = Some(token.clone());
        Ok(token)
    }

    /// Move a session along a lifecycle edge.
    ///
    /// Returns the previous state. Edges the lifecycle does not allow are
    /// rejected with `InvalidTransition` and leave the record untouched.
    pub async fn transition(
        &self,
        id: &SessionId,
        to: SessionState,
        reason: Option<String>,
    ) -> Result<SessionState, SessionError> {
        let _lock = self.write_lock.lock().await;
        self.transition_locked(id, to, reason)
    }

    fn transition_locked(
        &self,
        id: &SessionId,
        to: SessionState,
        reason: Option<String>,
    ) -> Result<SessionState, SessionError> {
        let (from, event) = {
            let mut entry = self
                .sessions
                .get_mut(id)
                .ok_or_else(|| SessionError::NotFound(id.clone()))?;
            let from = entry.info.state;
            if !from.can_transition_to(to, entry.info.role) {
                return Err(SessionError::InvalidTransition {
                    id: id.clone(),
                    from,
                    to,
                });
            }

            entry.info.state = to;
            entry.info.last_activity_at = current_time_millis();
            entry.state_since = Instant::now();
            if from == SessionState::Disconnected && !to.is_terminating() {
                entry.info.reconnects += 1;
            }
            if reason.is_some() {
                entry.info.reason = reason.clone();
            }
            if to == SessionState::Closing {
                if let Some(token) = &entry.claim {
                    token.cancel();
                }
            }

            match &reason {
                Some(r) => {
                    tracing::info!(session = %id, %from, %to, reason = %r, "Session state changed")
                }
                None => tracing::info!(session = %id, %from, %to, "Session state changed"),
            }

            let event = SessionEvent::StateChanged {
                id: id.clone(),
                from,
                to,
                reason,
            };
            (from, event)
        };

        if to == SessionState::Closed {
            self.closed.notify_waiters();
        }
        let _ = self.events.send(event);
        Ok(from)
    }

    /// Record tunnel activity
    pub fn touch(&self, id: &SessionId) {
        if let Some(mut entry) = self.sessions.get_mut(id) {
            entry.info.last_activity_at = current_time_millis();
        }
    }

    /// Give a pending host session a different relay port after the relay
    /// refused to bind the current one.
    pub async fn reassign_port(&self, id: &SessionId) -> Result<u16, SessionError> {
        let _lock = self.write_lock.lock().await;

        let current = self.get(id)?;
        if current.role != Role::Host || current.state.is_terminating() {
            return Err(SessionError::InvalidTransition {
                id: id.clone(),
                from: current.state,
                to: SessionState::Pending,
            });
        }

        // the rejected port stays excluded: the relay already said no
        let in_use = self.ports_in_use();
        let port = self.allocator.allocate(&in_use)?;
        if let Some(mut entry) = self.sessions.get_mut(id) {
            entry.info.tunnel_port = port;
        }
        tracing::info!(session = %id, old = current.tunnel_port, new = port, "Relay port reassigned");
        Ok(port)
    }

    /// Close one or all sessions.
    ///
    /// Claimed sessions move to `Closing` and their driver is cancelled; it
    /// finishes the teardown. Unclaimed sessions go straight to `Closed`.
    /// Returns how many sessions were moved. An unknown or already closed id
    /// is [`SessionError::NotFound`].
    pub async fn close(&self, target: CloseTarget) -> Result<usize, SessionError> {
        let _lock = self.write_lock.lock().await;

        match target {
            CloseTarget::One(id) => {
                let state = self
                    .sessions
                    .get(&id)
                    .map(|entry| entry.info.state)
                    .ok_or_else(|| SessionError::NotFound(id.clone()))?;
                match state {
                    SessionState::Closed => Err(SessionError::NotFound(id)),
                    SessionState::Closing => Ok(0),
                    _ => {
                        self.close_locked(&id, "closed by request")?;
                        Ok(1)
                    }
                }
            }
            CloseTarget::All => {
                let ids: Vec<SessionId> = self
                    .sessions
                    .iter()
                    .filter(|entry| !entry.info.state.is_terminating())
                    .map(|entry| entry.key().clone())
                    .collect();
                let mut count = 0;
                for id in ids {
                    if self.close_locked(&id, "closed by request").is_ok() {
                        count += 1;
                    }
                }
                Ok(count)
            }
        }
    }

    fn close_locked(&self, id: &SessionId, reason: &str) -> Result<(), SessionError> {
        let claimed = self
            .sessions
            .get(id)
            .map(|entry| entry.claim.is_some())
            .unwrap_or(false);
        self.transition_locked(id, SessionState::Closing, Some(reason.to_string()))?;
        if !claimed {
            self.transition_locked(id, SessionState::Closed, None)?;
        }
        Ok(())
    }

    /// One maintenance pass.
    ///
    /// - `Disconnected` past the reconnect grace period moves to `Closing`
    /// - `Closing` past the closing timeout is forced to `Closed`
    /// - `Closed` past the retention period is removed
    pub async fn reap(&self) -> ReapStats {
        let _lock = self.write_lock.lock().await;
        let mut stats = ReapStats::default();

        let snapshot: Vec<(SessionId, SessionState, Duration)> = self
            .sessions
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    entry.info.state,
                    entry.state_since.elapsed(),
                )
            })
            .collect();

        for (id, state, age) in snapshot {
            match state {
                SessionState::Disconnected if age >= self.config.reconnect_grace => {
                    if self
                        .close_locked(&id, "reconnection grace period expired")
                        .is_ok()
                    {
                        stats.expired += 1;
                    }
                }
                SessionState::Closing if age >= self.config.closing_timeout => {
                    tracing::warn!(session = %id, "Teardown did not finish in time; forcing closed");
                    if self
                        .transition_locked(&id, SessionState::Closed, None)
                        .is_ok()
                    {
                        stats.forced += 1;
                    }
                }
                SessionState::Closed if age >= self.config.closed_retention => {
                    if self.sessions.remove(&id).is_some() {
                        tracing::debug!(session = %id, "Session removed from registry");
                        let _ = self.events.send(SessionEvent::Removed { id });
                        stats.removed += 1;
                    }
                }
                _ => {}
            }
        }

        if stats != ReapStats::default() {
            tracing::info!(
                "Reaped sessions: {} expired, {} forced closed, {} removed",
                stats.expired,
                stats.forced,
                stats.removed
            );
        }
        stats
    }

    /// Close everything and wait up to `timeout` for drivers to finish.
    ///
    /// Sessions still not `Closed` afterwards are forced closed.
    pub async fn teardown(&self, timeout: Duration) {
        let _ = self.close(CloseTarget::All).await;

        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.closed.notified();
            if self.all_closed() {
                return;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        let _lock = self.write_lock.lock().await;
        let pending: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| !entry.info.state.is_closed())
            .map(|entry| entry.key().clone())
            .collect();
        for id in pending {
            tracing::warn!(session = %id, "Forcing session closed at shutdown");
            let _ = self.transition_locked(&id, SessionState::Closing, None);
            let _ = self.transition_locked(&id, SessionState::Closed, None);
        }
    }

    fn all_closed(&self) -> bool {
        self.sessions.iter().all(|entry| entry.info.state.is_closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(start: u16, end: u16) -> SessionRegistry {
        SessionRegistry::new(
            SessionConfig::default(),
            PortRange {
                start,
                end,
                max_attempts: 100,
            },
        )
    }

    fn relay() -> RelayTarget {
        RelayTarget::new("relay.test", 22)
    }

    async fn host(registry: &SessionRegistry) -> SessionInfo {
        registry
            .create(Role::Host, relay(), None, Some(ShellKind::Bash))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_ids_and_ports_are_unique() {
        let registry = registry(20000, 20049);
        let mut ids = HashSet::new();
        let mut ports = HashSet::new();
        for _ in 0..40 {
            let info = host(&registry).await;
            assert_eq!(info.state, SessionState::Pending);
            assert!(ids.insert(info.id));
            assert!(ports.insert(info.tunnel_port));
        }
        assert_eq!(registry.len(), 40);
    }

    #[tokio::test]
    async fn test_client_port_collision_is_rejected() {
        let registry = registry(41523, 41523);
        let info = host(&registry).await;
        assert_eq!(info.tunnel_port, 41523);

        let result = registry
            .create(Role::Client, relay(), Some(41523), None)
            .await;
        assert!(matches!(result, Err(SessionError::PortInUse(41523))));
    }

    #[tokio::test]
    async fn test_exhausted_range() {
        let registry = registry(41523, 41523);
        host(&registry).await;
        let result = registry.create(Role::Host, relay(), None, None).await;
        assert!(matches!(
            result,
            Err(SessionError::PortAllocationFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_transition_leaves_record() {
        let registry = registry(20000, 20010);
        let info = host(&registry).await;

        let result = registry
            .transition(&info.id, SessionState::Connected, None)
            .await;
        assert!(matches!(result, Err(SessionError::InvalidTransition { .. })));
        assert_eq!(registry.get(&info.id).unwrap().state, SessionState::Pending);

        let from = registry
            .transition(&info.id, SessionState::Listening, None)
            .await
            .unwrap();
        assert_eq!(from, SessionState::Pending);
    }

    #[tokio::test]
    async fn test_close_unknown_id_changes_nothing() {
        let registry = registry(20000, 20010);
        let info = host(&registry).await;
        let before = registry.list();

        let result = registry
            .close(CloseTarget::One(SessionId::from("deadbeef")))
            .await;
        assert!(matches!(result, Err(SessionError::NotFound(_))));
        assert_eq!(registry.list(), before);
        assert_eq!(registry.get(&info.id).unwrap().state, SessionState::Pending);
    }

    #[tokio::test]
    async fn test_close_unclaimed_releases_port() {
        let registry = registry(41523, 41523);
        let info = host(&registry).await;

        assert_eq!(registry.close(CloseTarget::One(info.id.clone())).await.unwrap(), 1);
        assert_eq!(registry.get(&info.id).unwrap().state, SessionState::Closed);
        assert!(registry.ports_in_use().is_empty());

        // closing again reports not found
        assert!(matches!(
            registry.close(CloseTarget::One(info.id.clone())).await,
            Err(SessionError::NotFound(_))
        ));

        let next = host(&registry).await;
        assert_eq!(next.tunnel_port, 41523);
        assert_ne!(next.id, info.id);
    }

    #[tokio::test]
    async fn test_close_claimed_cancels_driver() {
        let registry = registry(20000, 20010);
        let info = host(&registry).await;
        let token = registry.claim(&info.id).await.unwrap();
        assert!(matches!(
            registry.claim(&info.id).await,
            Err(SessionError::AlreadyClaimed(_))
        ));

        assert_eq!(registry.close(CloseTarget::All).await.unwrap(), 1);
        assert!(token.is_cancelled());
        let closing = registry.get(&info.id).unwrap();
        assert_eq!(closing.state, SessionState::Closing);
        assert_eq!(closing.reason.as_deref(), Some("closed by request"));
        // port is still held until the driver reports Closed
        assert!(registry.ports_in_use().contains(&info.tunnel_port));
    }

    #[tokio::test]
    async fn test_reconnect_counter() {
        let registry = registry(20000, 20010);
        let id = host(&registry).await.id;
        for state in [
            SessionState::Listening,
            SessionState::Connected,
            SessionState::Disconnected,
            SessionState::Listening,
            SessionState::Connected,
        ] {
            registry.transition(&id, state, None).await.unwrap();
        }
        assert_eq!(registry.get(&id).unwrap().reconnects, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_expires_disconnected_after_grace() {
        let registry = registry(41523, 41523);
        let id = host(&registry).await.id;
        for state in [
            SessionState::Listening,
            SessionState::Connected,
            SessionState::Disconnected,
        ] {
            registry.transition(&id, state, None).await.unwrap();
        }

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(registry.reap().await, ReapStats::default());
        assert_eq!(registry.get(&id).unwrap().state, SessionState::Disconnected);

        tokio::time::advance(Duration::from_secs(2)).await;
        let stats = registry.reap().await;
        assert_eq!(stats.expired, 1);
        let info = registry.get(&id).unwrap();
        assert_eq!(info.state, SessionState::Closed);
        assert_eq!(info.reason.as_deref(), Some("reconnection grace period expired"));
        assert!(registry.ports_in_use().is_empty());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(registry.reap().await.removed, 1);
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_forces_stuck_closing() {
        let registry = registry(20000, 20010);
        let id = host(&registry).await.id;
        let _token = registry.claim(&id).await.unwrap();
        registry.close(CloseTarget::One(id.clone())).await.unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(registry.reap().await.forced, 1);
        assert_eq!(registry.get(&id).unwrap().state, SessionState::Closed);
    }

    #[tokio::test]
    async fn test_reassign_port() {
        let registry = registry(20000, 20001);
        let info = host(&registry).await;
        let new_port = registry.reassign_port(&info.id).await.unwrap();
        assert_ne!(new_port, info.tunnel_port);
        assert_eq!(registry.get(&info.id).unwrap().tunnel_port, new_port);
    }

    #[tokio::test]
    async fn test_events_are_broadcast() {
        let registry = registry(20000, 20010);
        let mut events = registry.subscribe();
        let id = host(&registry).await.id;
        registry
            .transition(&id, SessionState::Listening, None)
            .await
            .unwrap();

        assert!(matches!(events.recv().await.unwrap(), SessionEvent::Created(_)));
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::StateChanged {
                id,
                from: SessionState::Pending,
                to: SessionState::Listening,
                reason: None,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_forces_unfinished_drivers() {
        let registry = registry(20000, 20010);
        let id = host(&registry).await.id;
        let _token = registry.claim(&id).await.unwrap();

        registry.teardown(Duration::from_secs(1)).await;
        assert_eq!(registry.get(&id).unwrap().state, SessionState::Closed);
    }
}
