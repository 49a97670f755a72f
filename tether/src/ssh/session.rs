// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use russh::client::{self, AuthResult};
use russh::keys::agent::client::AgentClient;
use russh::keys::{PrivateKeyWithHashAlg, load_secret_key};

use crate::errors::Error;

/// Client handler that accepts the server host key. Targets are disposable
/// test machines and are not pinned in known_hosts.
#[derive(Clone, Debug)]
pub(crate) struct ClientHandler;

impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Per-target session template. Every transaction clones a fresh session
/// from it: connect, authenticate, use, disconnect.
pub(crate) struct SessionTemplate {
    host: String,
    port: u16,
    config: Arc<client::Config>,
}

impl SessionTemplate {
    pub(crate) fn new(host: String, port: u16) -> SessionTemplate {
        let config = client::Config {
            // reasonable channel buffer and window sizes for streaming
            channel_buffer_size: 64,
            window_size: 1024 * 1024,
            ..Default::default()
        };
        SessionTemplate { host, port, config: Arc::new(config) }
    }

    pub(crate) fn host(&self) -> &str {
        &self.host
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    /// Opens an authenticated session as `user` (`root` when unset).
    /// Authentication is public key only: agent identities first, then the
    /// conventional on-disk keys with no passphrase.
    pub(crate) async fn open(
        &self,
        user: Option<&str>,
    ) -> std::result::Result<client::Handle<ClientHandler>, Error> {
        let user = user.unwrap_or("root");
        match self.connect_and_auth(user).await {
            Ok(handle) => Ok(handle),
            Err(err) => {
                log::debug!(
                    "opening session to {}:{} as {user} failed: {err:#}",
                    self.host,
                    self.port
                );
                Err(Error::OpenSession)
            }
        }
    }

    async fn connect_and_auth(&self, user: &str) -> Result<client::Handle<ClientHandler>> {
        let mut handle = client::connect(
            self.config.clone(),
            (self.host.as_str(), self.port),
            ClientHandler,
        )
        .await
        .context("SSH connect failed")?;

        if try_agent_keys(&mut handle, user).await? || try_default_keys(&mut handle, user).await? {
            return Ok(handle);
        }

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "", "")
            .await;
        Err(anyhow!("public key authentication failed for {user}"))
    }
}

/// Offers every identity a reachable ssh-agent holds. A missing or empty
/// agent is not an error, only a miss.
async fn try_agent_keys(
    handle: &mut client::Handle<ClientHandler>,
    user: &str,
) -> Result<bool> {
    let Ok(mut agent) = AgentClient::connect_env().await else {
        return Ok(false);
    };
    let Ok(identities) = agent.request_identities().await else {
        return Ok(false);
    };
    let hash = handle.best_supported_rsa_hash().await?.flatten();
    for key in identities {
        match handle
            .authenticate_publickey_with(user.to_string(), key, hash, &mut agent)
            .await
        {
            Ok(AuthResult::Success) => return Ok(true),
            Ok(AuthResult::Failure { .. }) => {}
            Err(err) => {
                log::debug!("agent key rejected for {user}: {err}");
            }
        }
    }
    Ok(false)
}

/// Falls back to the user's standard key files, loaded with no passphrase.
async fn try_default_keys(
    handle: &mut client::Handle<ClientHandler>,
    user: &str,
) -> Result<bool> {
    let Some(dir) = default_key_dir() else {
        return Ok(false);
    };
    let hash = handle.best_supported_rsa_hash().await?.flatten();
    for name in ["id_ed25519", "id_ecdsa", "id_rsa"] {
        let path = dir.join(name);
        if !path.exists() {
            continue;
        }
        let key = match load_secret_key(&path, None) {
            Ok(key) => key,
            Err(err) => {
                log::debug!("skipping identity {}: {err}", path.display());
                continue;
            }
        };
        let key = PrivateKeyWithHashAlg::new(Arc::new(key), hash);
        match handle.authenticate_publickey(user.to_string(), key).await? {
            AuthResult::Success => {
                log::debug!("authenticated as {user} with {}", path.display());
                return Ok(true);
            }
            AuthResult::Failure { .. } => {}
        }
    }
    Ok(false)
}

fn default_key_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".ssh"))
}

#[cfg(test)]
mod tests {
    use super::SessionTemplate;

    #[test]
    fn template_keeps_host_and_port() {
        let template = SessionTemplate::new("sut.example".to_string(), 2200);
        assert_eq!(template.host(), "sut.example");
        assert_eq!(template.port(), 2200);
    }
}
