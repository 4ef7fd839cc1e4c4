//! Live sessions to management servers, with periodic health sweeps.

use std::fmt;
use std::sync::Arc;

use snapmgr_common::{ManagementApi, Result, SessionRef};
use tracing::{error, info, warn};

/// Kept in memory for the session's lifetime so a dropped connection can be
/// re-established without prompting.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug)]
pub struct Connection {
    pub hostname: String,
    pub session: SessionRef,
    pub healthy: bool,
    credentials: Credentials,
}

/// Insertion-ordered set of live connections. Owned by the interactive
/// surface's session controller; workers only ever see immutable copies of
/// the (hostname, session) pairs.
pub struct ConnectionRegistry {
    api: Arc<dyn ManagementApi>,
    connections: Vec<Connection>,
}

impl ConnectionRegistry {
    pub fn new(api: Arc<dyn ManagementApi>) -> Self {
        Self {
            api,
            connections: Vec::new(),
        }
    }

    pub async fn connect(&mut self, hostname: &str, username: &str, password: &str) -> Result<()> {
        let session = self.api.connect(hostname, username, password).await?;
        info!(%hostname, "connected");

        let connection = Connection {
            hostname: hostname.to_string(),
            session,
            healthy: true,
            credentials: Credentials {
                username: username.to_string(),
                password: password.to_string(),
            },
        };

        // Reconnecting an already-known server replaces its session in place.
        match self
            .connections
            .iter_mut()
            .find(|c| c.hostname == hostname)
        {
            Some(existing) => *existing = connection,
            None => self.connections.push(connection),
        }
        Ok(())
    }

    /// Tears down every session and forgets the held credentials.
    /// Disconnect failures are ignored; the remote session will expire.
    pub async fn disconnect_all(&mut self) {
        for connection in self.connections.drain(..) {
            let _ = self.api.disconnect(&connection.session).await;
        }
    }

    /// Immutable snapshot of the active (hostname, session) pairs for a
    /// background worker.
    pub fn sessions(&self) -> Vec<(String, SessionRef)> {
        self.connections
            .iter()
            .map(|c| (c.hostname.clone(), c.session.clone()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn hostnames(&self) -> Vec<String> {
        self.connections.iter().map(|c| c.hostname.clone()).collect()
    }

    /// Health-checks every connection. An unreachable one gets a single
    /// reconnect attempt from the held credentials; if that also fails the
    /// connection and its credentials are dropped.
    pub async fn health_sweep(&mut self) {
        let api = Arc::clone(&self.api);
        let mut dropped: Vec<String> = Vec::new();

        for connection in &mut self.connections {
            if api.health_check(&connection.session).await {
                connection.healthy = true;
                continue;
            }

            warn!(hostname = %connection.hostname, "connection lost, attempting reconnect");
            match api
                .connect(
                    &connection.hostname,
                    &connection.credentials.username,
                    &connection.credentials.password,
                )
                .await
            {
                Ok(session) => {
                    info!(hostname = %connection.hostname, "reconnected");
                    connection.session = session;
                    connection.healthy = true;
                }
                Err(e) => {
                    error!(hostname = %connection.hostname, error = %e, "reconnect failed, dropping connection");
                    dropped.push(connection.hostname.clone());
                }
            }
        }

        self.connections.retain(|c| !dropped.contains(&c.hostname));
    }
}
