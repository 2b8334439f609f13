// Copyright 2020 Joyent, Inc.

//! Caller authentication.
//!
//! A connection is authenticated once, from its init message. Every later
//! message on the connection runs with the identity established then.

use std::error::Error as StdError;
use std::fmt;
use std::io::{Error, ErrorKind};
use std::sync::Arc;

use crate::config::{AuthConfig, AuthMode};
use crate::msg::PersistInitMsg;

/// Verified caller identity, fixed for the lifetime of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Identity {
    pub uid: u32,
    pub gid: u32,
    pub auth_valid: bool,
}

/// What a caller claims about itself.
#[derive(Clone, Copy, Debug)]
pub struct AuthCred<'a> {
    pub uid: u32,
    pub gid: u32,
    pub token: Option<&'a str>,
}

impl<'a> AuthCred<'a> {
    pub fn from_init(init: &'a PersistInitMsg) -> AuthCred<'a> {
        AuthCred {
            uid: init.uid,
            gid: init.gid,
            token: init.auth_token.as_deref(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthError {
    MissingToken { uid: u32 },
    BadToken { uid: u32 },
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::MissingToken { uid } => {
                write!(f, "no credential presented for uid {}", uid)
            }
            AuthError::BadToken { uid } => {
                write!(f, "invalid credential presented for uid {}", uid)
            }
        }
    }
}

impl StdError for AuthError {}

impl From<AuthError> for Error {
    fn from(error: AuthError) -> Self {
        Error::new(ErrorKind::PermissionDenied, error)
    }
}

pub trait Authenticator: Send + Sync {
    fn verify(&self, cred: &AuthCred<'_>) -> Result<Identity, AuthError>;
}

/// Accepts the claimed ids as they are. Suitable only where every peer is
/// trusted, such as loopback tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct TrustedAuth;

impl Authenticator for TrustedAuth {
    fn verify(&self, cred: &AuthCred<'_>) -> Result<Identity, AuthError> {
        Ok(Identity {
            uid: cred.uid,
            gid: cred.gid,
            auth_valid: true,
        })
    }
}

/// Requires the caller to present a shared secret.
#[derive(Clone, Debug)]
pub struct TokenAuth {
    token: String,
}

impl TokenAuth {
    pub fn new(token: &str) -> TokenAuth {
        TokenAuth {
            token: token.to_string(),
        }
    }
}

// Compares every byte so the time taken does not depend on where the
// first mismatch is.
fn same_bytes(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

impl Authenticator for TokenAuth {
    fn verify(&self, cred: &AuthCred<'_>) -> Result<Identity, AuthError> {
        let token = cred
            .token
            .ok_or(AuthError::MissingToken { uid: cred.uid })?;
        if !same_bytes(token.as_bytes(), self.token.as_bytes()) {
            return Err(AuthError::BadToken { uid: cred.uid });
        }
        Ok(Identity {
            uid: cred.uid,
            gid: cred.gid,
            auth_valid: true,
        })
    }
}

/// Build the authenticator selected by configuration. The configuration is
/// expected to have been validated.
pub fn from_config(config: &AuthConfig) -> Arc<dyn Authenticator> {
    match (config.mode, &config.token) {
        (AuthMode::Token, Some(token)) => Arc::new(TokenAuth::new(token)),
        (AuthMode::Token, None) => Arc::new(TokenAuth::new("")),
        (AuthMode::Trusted, _) => Arc::new(TrustedAuth),
    }
}
