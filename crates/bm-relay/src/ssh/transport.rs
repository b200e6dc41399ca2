//! `russh` implementation of the relay transport
//!
//! One SSH connection per session. The host side asks the relay for a
//! `tcpip-forward` on the session port and receives the client's dial-ins as
//! `forwarded-tcpip` channels; the client side opens a `direct-tcpip`
//! channel to the same port on the relay.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Config, Handle, Msg};
use russh::{Channel, Disconnect};
use russh_keys::key::{KeyPair, PublicKey};
use tokio::sync::mpsc;

use bm_core::config::RelayConfig;
use bm_core::traits::{RelayConnection, RelayTransport, TunnelStream};
use bm_core::{ConnectionError, RelayTarget};

/// Forwarded connections waiting to be accepted.
///
/// A session serves one client at a time; anything beyond a short backlog
/// is refused.
const FORWARDED_CHANNEL_CAPACITY: usize = 16;

/// Keepalive sent by the SSH layer so idle relays do not drop the connection
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Opens SSH connections to the relay
pub struct SshTransport {
    config: RelayConfig,
}

impl SshTransport {
    pub fn new(config: RelayConfig) -> Self {
        Self { config }
    }

    fn load_identities(&self) -> Result<Vec<Arc<KeyPair>>, ConnectionError> {
        let candidates = self.config.identity_candidates();
        if candidates.is_empty() {
            return Err(ConnectionError::NoIdentity(
                "no identity files configured and none found in ~/.ssh".to_string(),
            ));
        }

        let mut keys = Vec::new();
        let mut failures = Vec::new();
        for path in &candidates {
            match load_identity(path) {
                Ok(key) => keys.push(Arc::new(key)),
                Err(e) => {
                    tracing::debug!("Skipping identity {:?}: {}", path, e);
                    failures.push(format!("{}: {}", path.display(), e));
                }
            }
        }

        if keys.is_empty() {
            return Err(ConnectionError::NoIdentity(failures.join("; ")));
        }
        Ok(keys)
    }
}

fn load_identity(path: &Path) -> Result<KeyPair, String> {
    if !path.exists() {
        return Err("file does not exist".to_string());
    }
    russh_keys::load_secret_key(path, None).map_err(|e| e.to_string())
}

#[async_trait]
impl RelayTransport for SshTransport {
    async fn connect(
        &self,
        target: &RelayTarget,
    ) -> Result<Box<dyn RelayConnection>, ConnectionError> {
        let keys = self.load_identities()?;
        let user = target
            .username
            .clone()
            .unwrap_or_else(|| self.config.username.clone());

        let ssh_config = Arc::new(Config {
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            ..Default::default()
        });

        let (forwarded_tx, forwarded_rx) = mpsc::channel(FORWARDED_CHANNEL_CAPACITY);
        let rejection = Arc::new(Mutex::new(None));
        let handler = RelayHandler {
            host: target.host.clone(),
            port: target.port,
            pinned_fingerprint: self.config.host_key_fingerprint.clone(),
            rejection: Arc::clone(&rejection),
            forwarded: forwarded_tx,
        };

        tracing::debug!("Connecting to relay {}", target.address());
        let connecting = client::connect(ssh_config, target.address(), handler);
        let mut handle = match tokio::time::timeout(self.config.connect_timeout, connecting).await {
            Err(_) => {
                return Err(ConnectionError::RelayUnreachable {
                    attempts: 1,
                    reason: format!("timed out after {:?}", self.config.connect_timeout),
                })
            }
            Ok(Err(e)) => {
                let rejected = rejection.lock().ok().and_then(|mut slot| slot.take());
                return Err(match rejected {
                    Some(message) => ConnectionError::HostKeyRejected(message),
                    None => ConnectionError::RelayUnreachable {
                        attempts: 1,
                        reason: e.to_string(),
                    },
                });
            }
            Ok(Ok(handle)) => handle,
        };

        tracing::debug!("Authenticating as user '{}'", user);
        let mut authenticated = false;
        for key in keys {
            match handle.authenticate_publickey(user.clone(), key).await {
                Ok(true) => {
                    authenticated = true;
                    break;
                }
                Ok(false) => continue,
                Err(e) => {
                    return Err(ConnectionError::ConnectionLost(format!(
                        "authentication error: {}",
                        e
                    )))
                }
            }
        }
        if !authenticated {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await;
            return Err(ConnectionError::AuthenticationFailed {
                user,
                host: target.host.clone(),
            });
        }

        tracing::info!("Authenticated to relay {} as {}", target, user);
        Ok(Box::new(SshConnection {
            handle,
            bind_address: self.config.bind_address.clone(),
            forwarded: forwarded_rx,
        }))
    }
}

/// An authenticated SSH connection to the relay
pub struct SshConnection {
    handle: Handle<RelayHandler>,
    bind_address: String,
    forwarded: mpsc::Receiver<TunnelStream>,
}

impl SshConnection {
    fn lost_or(&self, e: russh::Error, otherwise: ConnectionError) -> ConnectionError {
        if self.handle.is_closed() {
            ConnectionError::ConnectionLost(e.to_string())
        } else {
            otherwise
        }
    }
}

#[async_trait]
impl RelayConnection for SshConnection {
    async fn request_reverse_forward(&mut self, port: u16) -> Result<(), ConnectionError> {
        tracing::debug!("Requesting reverse forward {}:{}", self.bind_address, port);
        match self
            .handle
            .tcpip_forward(self.bind_address.clone(), port as u32)
            .await
        {
            Ok(_) => {
                tracing::info!("Relay bound {}:{}", self.bind_address, port);
                Ok(())
            }
            Err(e) => {
                tracing::debug!("Reverse forward on {} failed: {}", port, e);
                Err(self.lost_or(e, ConnectionError::BindRejected { port }))
            }
        }
    }

    async fn cancel_reverse_forward(&mut self, port: u16) -> Result<(), ConnectionError> {
        self.handle
            .cancel_tcpip_forward(self.bind_address.clone(), port as u32)
            .await
            .map_err(|e| ConnectionError::ConnectionLost(e.to_string()))?;
        tracing::debug!("Cancelled reverse forward on {}", port);
        Ok(())
    }

    async fn open_forwarded_channel(
        &mut self,
        host: &str,
        port: u16,
    ) -> Result<TunnelStream, ConnectionError> {
        tracing::debug!("Opening direct-tcpip channel to {}:{}", host, port);
        match self
            .handle
            .channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await
        {
            Ok(channel) => Ok(Box::new(channel.into_stream())),
            Err(e) => {
                let refused = ConnectionError::ChannelOpenFailed(format!("{}:{}: {}", host, port, e));
                Err(self.lost_or(e, refused))
            }
        }
    }

    async fn accept_forwarded_connection(&mut self) -> Option<TunnelStream> {
        self.forwarded.recv().await
    }

    async fn close(&mut self) {
        if self.handle.is_closed() {
            return;
        }
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            tracing::debug!("Relay disconnect failed: {}", e);
        }
    }
}

/// SSH client handler for relay connections
struct RelayHandler {
    host: String,
    port: u16,
    pinned_fingerprint: Option<String>,
    /// Why the host key was refused, for error reporting after `connect`
    rejection: Arc<Mutex<Option<String>>>,
    forwarded: mpsc::Sender<TunnelStream>,
}

impl RelayHandler {
    fn reject(&self, message: String) -> bool {
        tracing::error!("{}", message);
        if let Ok(mut slot) = self.rejection.lock() {
            *slot = Some(message);
        }
        false
    }
}

#[async_trait]
impl client::Handler for RelayHandler {
    type Error = anyhow::Error;

    /// Pinned fingerprint first, then `known_hosts`. Unknown hosts are
    /// accepted with a warning; a changed key never is.
    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();
        tracing::debug!("Relay host key: {}", fingerprint);

        if let Some(expected) = &self.pinned_fingerprint {
            let expected = expected.trim_start_matches("SHA256:");
            if fingerprint.trim_start_matches("SHA256:") == expected {
                tracing::debug!("Host key matches pinned fingerprint");
                return Ok(true);
            }
            return Ok(self.reject(format!(
                "{}: host key {} does not match pinned fingerprint {}",
                self.host, fingerprint, expected
            )));
        }

        match russh_keys::check_known_hosts(&self.host, self.port, server_public_key) {
            Ok(true) => Ok(true),
            Ok(false) => {
                tracing::warn!(
                    "Relay {} is not in known_hosts (key {}); accepting",
                    self.host,
                    fingerprint
                );
                Ok(true)
            }
            Err(russh_keys::Error::KeyChanged { line }) => Ok(self.reject(format!(
                "{}: host key changed (known_hosts line {})",
                self.host, line
            ))),
            Err(e) => {
                tracing::warn!("Could not read known_hosts: {}; accepting relay key", e);
                Ok(true)
            }
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!(
            "Forwarded connection to {}:{} from {}:{}",
            connected_address,
            connected_port,
            originator_address,
            originator_port
        );
        let stream: TunnelStream = Box::new(channel.into_stream());
        if self.forwarded.try_send(stream).is_err() {
            tracing::warn!("Dropping forwarded connection; backlog full");
        }
        Ok(())
    }
}
