//! Credential chain construction and user authentication

use crate::{ServerIdentity, TransportError};
use ssh2::Session;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One authentication method, ready to be offered to the server
#[derive(Clone)]
pub enum Credential {
    /// Plain password
    Password(String),
    /// Private key loaded from disk
    PrivateKey {
        /// Resolved key file path
        path: PathBuf,
        /// Key contents
        pem: String,
    },
}

impl Credential {
    /// SSH method name
    pub fn method(&self) -> &'static str {
        match self {
            Credential::Password(_) => "password",
            Credential::PrivateKey { .. } => "publickey",
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Password(<redacted>)"),
            Credential::PrivateKey { path, .. } => f
                .debug_struct("PrivateKey")
                .field("path", path)
                .finish_non_exhaustive(),
        }
    }
}

/// Build the credential chain for an identity.
///
/// The password comes first when set, the identity file second. Key files
/// are read here, so a missing or malformed key fails before any dial.
pub fn credential_chain(identity: &ServerIdentity) -> Result<Vec<Credential>, TransportError> {
    let mut chain = Vec::new();

    if let Some(password) = identity.password.as_deref().filter(|p| !p.is_empty()) {
        chain.push(Credential::Password(password.to_string()));
    }

    if let Some(path) = identity
        .identity_file
        .as_deref()
        .filter(|p| !p.as_os_str().is_empty())
    {
        chain.push(load_private_key(path)?);
    }

    Ok(chain)
}

/// Expand a leading `~` against the home directory.
///
/// Only `~` and `~/...` are expanded; `~user` forms are left alone.
pub fn expand_home(path: &Path) -> Result<PathBuf, TransportError> {
    let Ok(rest) = path.strip_prefix("~") else {
        return Ok(path.to_path_buf());
    };
    let home = dirs::home_dir()
        .ok_or_else(|| TransportError::Credentials("cannot resolve home directory".to_string()))?;
    Ok(home.join(rest))
}

fn load_private_key(path: &Path) -> Result<Credential, TransportError> {
    let resolved = expand_home(path)?;
    let pem = fs::read_to_string(&resolved).map_err(|e| {
        TransportError::Credentials(format!("read {}: {}", resolved.display(), e))
    })?;

    if !looks_like_private_key(&pem) {
        return Err(TransportError::Credentials(format!(
            "{} does not contain a private key",
            resolved.display()
        )));
    }

    debug!("Loaded private key from {}", resolved.display());
    Ok(Credential::PrivateKey { path: resolved, pem })
}

fn looks_like_private_key(pem: &str) -> bool {
    let trimmed = pem.trim_start();
    trimmed.starts_with("-----BEGIN ") && trimmed.contains("PRIVATE KEY-----")
}

/// Offer each credential in order until the server accepts one
pub fn authenticate(
    session: &Session,
    user: &str,
    chain: &[Credential],
) -> Result<(), TransportError> {
    if chain.is_empty() {
        return Err(TransportError::Authentication(format!(
            "no credentials configured for {}",
            user
        )));
    }

    let mut failures = Vec::with_capacity(chain.len());
    for credential in chain {
        let result = match credential {
            Credential::Password(password) => session.userauth_password(user, password),
            Credential::PrivateKey { pem, .. } => {
                session.userauth_pubkey_memory(user, None, pem, None)
            }
        };

        match result {
            Ok(()) if session.authenticated() => {
                debug!("Authenticated {} with {}", user, credential.method());
                return Ok(());
            }
            Ok(()) => failures.push(format!("{}: rejected", credential.method())),
            Err(e) => {
                debug!("{} authentication for {} failed: {}", credential.method(), user, e);
                failures.push(format!("{}: {}", credential.method(), e));
            }
        }
    }

    Err(TransportError::Authentication(format!(
        "{} ({})",
        user,
        failures.join("; ")
    )))
}
