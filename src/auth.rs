//! Login flow: turn a [`LoginSpec`] into a session token.

use async_trait::async_trait;
use log::debug;
use std::collections::BTreeSet as Set;
use std::sync::Arc;

use crate::{Error, Result};

pub mod authenticator;
pub mod client;
pub mod jwe;


pub use authenticator::Authenticator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthenticationMode {
    Token,
    Basic,
}
impl std::str::FromStr for AuthenticationMode {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "token" => Ok(Self::Token),
            "basic" => Ok(Self::Basic),
            _ => Err(format!("unknown authentication mode: {s}")),
        }
    }
}
impl std::fmt::Display for AuthenticationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Token => f.write_str("token"),
            Self::Basic => f.write_str("basic"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthenticationModes(Set<AuthenticationMode>);
impl AuthenticationModes {
    pub fn is_enabled(&self, mode: AuthenticationMode) -> bool {
        self.0.contains(&mode)
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    pub fn iter(&self) -> impl Iterator<Item = &AuthenticationMode> {
        self.0.iter()
    }
}
impl FromIterator<AuthenticationMode> for AuthenticationModes {
    fn from_iter<T: IntoIterator<Item = AuthenticationMode>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Credentials submitted by the user. At most one shape is expected to be filled.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoginSpec {
    pub username: String,
    pub password: String,
    pub token: String,
    pub kube_config: String,
}

/// Normalized credential used to talk to the API server on behalf of the user.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AuthInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}
impl AuthInfo {
    pub fn token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..Default::default()
        }
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwe_token: Option<String>,
    pub errors: Vec<Error>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRefreshSpec {
    pub jwe_token: String,
}

/// Failed login. `response` is set when the failure is not critical: it carries the error in
/// its error list, for callers reporting it to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginError {
    pub error: Error,
    pub response: Option<AuthResponse>,
}
impl From<Error> for LoginError {
    fn from(error: Error) -> Self {
        Self {
            error,
            response: None,
        }
    }
}
impl std::fmt::Display for LoginError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.error.fmt(f)
    }
}
impl std::error::Error for LoginError {}

#[async_trait]
pub trait TokenManager: Send + Sync {
    /// Encrypts the credential into an opaque session token.
    async fn generate(&self, auth_info: &AuthInfo) -> Result<String>;
    async fn decrypt(&self, token: &str) -> Result<AuthInfo>;
    /// Re-issues a still valid token with a new expiry.
    async fn refresh(&self, token: &str) -> Result<String>;
}

#[async_trait]
pub trait ClientManager: Send + Sync {
    /// Checks the credential is accepted by the API server.
    async fn has_access(&self, auth_info: &AuthInfo) -> Result<()>;
}

pub struct AuthManager {
    client_manager: Arc<dyn ClientManager>,
    token_manager: Arc<dyn TokenManager>,
    authentication_modes: AuthenticationModes,
    authentication_skippable: bool,
}

impl AuthManager {
    pub fn new(
        client_manager: Arc<dyn ClientManager>,
        token_manager: Arc<dyn TokenManager>,
        authentication_modes: AuthenticationModes,
        authentication_skippable: bool,
    ) -> Self {
        Self {
            client_manager,
            token_manager,
            authentication_modes,
            authentication_skippable,
        }
    }

    pub async fn login(&self, spec: &LoginSpec) -> std::result::Result<AuthResponse, LoginError> {
        let authenticator = self.authenticator(spec)?;
        let auth_info = authenticator.auth_info()?;

        if let Err(e) = self.client_manager.has_access(&auth_info).await {
            if e.is_critical() {
                return Err(e.into());
            }
            debug!("login rejected by the cluster: {e}");
            return Err(LoginError {
                response: Some(AuthResponse {
                    jwe_token: None,
                    errors: vec![e.clone()],
                }),
                error: e,
            });
        }

        let token = self.token_manager.generate(&auth_info).await?;

        Ok(AuthResponse {
            jwe_token: Some(token),
            errors: Vec::new(),
        })
    }

    pub async fn refresh(&self, jwe_token: &str) -> Result<String> {
        self.token_manager.refresh(jwe_token).await
    }

    pub fn authentication_modes(&self) -> Vec<AuthenticationMode> {
        self.authentication_modes.iter().copied().collect()
    }

    pub fn authentication_skippable(&self) -> bool {
        self.authentication_skippable
    }

    fn authenticator<'t>(&'t self, spec: &'t LoginSpec) -> Result<Authenticator<'t>> {
        use AuthenticationMode::*;

        let modes = &self.authentication_modes;
        if modes.is_empty() {
            return Err(Error::invalid(
                "All authentication options disabled. Check --authentication-mode argument for more information.",
            ));
        }

        if !spec.token.is_empty() && modes.is_enabled(Token) {
            Ok(Authenticator::Token(&spec.token))
        } else if !spec.username.is_empty() && !spec.password.is_empty() && modes.is_enabled(Basic)
        {
            Ok(Authenticator::Basic {
                username: &spec.username,
                password: &spec.password,
            })
        } else if !spec.kube_config.is_empty() {
            // not gated by a mode: the kubeconfig's credentials are filtered by mode instead
            Ok(Authenticator::KubeConfig {
                kube_config: &spec.kube_config,
                modes,
            })
        } else {
            Err(Error::invalid("Not enough data to create authenticator."))
        }
    }
}
