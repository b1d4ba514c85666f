use serde::Deserialize;

use super::{AuthInfo, AuthenticationMode, AuthenticationModes};
use crate::{Error, Result};

/// Login strategy selected from the shape of a login request.
#[derive(Debug, Clone, Copy)]
pub enum Authenticator<'t> {
    Token(&'t str),
    Basic {
        username: &'t str,
        password: &'t str,
    },
    /// Embedded kubeconfig; the current context's user credentials are extracted.
    KubeConfig {
        kube_config: &'t str,
        modes: &'t AuthenticationModes,
    },
}

impl Authenticator<'_> {
    pub fn auth_info(&self) -> Result<AuthInfo> {
        match *self {
            Self::Token(token) => Ok(AuthInfo::token(token)),
            Self::Basic { username, password } => Ok(AuthInfo::basic(username, password)),
            Self::KubeConfig { kube_config, modes } => kube_config_auth_info(kube_config, modes),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct KubeConfig {
    #[serde(default)]
    current_context: String,
    #[serde(default)]
    contexts: Vec<Named<Context>>,
    #[serde(default)]
    users: Vec<Named<User>>,
}

#[derive(Deserialize)]
struct Named<T> {
    name: String,
    #[serde(alias = "context", alias = "user")]
    value: T,
}

#[derive(Deserialize)]
struct Context {
    #[serde(default)]
    user: String,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct User {
    token: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

fn kube_config_auth_info(kube_config: &str, modes: &AuthenticationModes) -> Result<AuthInfo> {
    let config: KubeConfig = serde_yaml::from_str(kube_config)
        .map_err(|e| Error::invalid(format!("invalid kubeconfig: {e}")))?;

    let context = (config.contexts.iter())
        .find(|c| c.name == config.current_context)
        .ok_or_else(|| {
            Error::invalid(format!(
                "context was not found for specified context: {}",
                config.current_context
            ))
        })?;

    let user_name = &context.value.user;
    let user = (config.users.iter())
        .find(|u| &u.name == user_name)
        .map(|u| &u.value)
        .ok_or_else(|| Error::invalid(format!("auth info was not found for user: {user_name}")))?;

    let non_empty = |v: &Option<String>| v.clone().filter(|v| !v.is_empty());

    if modes.is_enabled(AuthenticationMode::Token) {
        if let Some(token) = non_empty(&user.token) {
            return Ok(AuthInfo::token(token));
        }
    }

    if modes.is_enabled(AuthenticationMode::Basic) {
        if let (Some(username), Some(password)) = (non_empty(&user.username), non_empty(&user.password)) {
            return Ok(AuthInfo::basic(username, password));
        }
    }

    Err(Error::invalid("Not enough data to create auth info structure."))
}

#[cfg(test)]
mod test {
    use super::*;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: dev
clusters:
- name: dev-cluster
  cluster:
    server: https://127.0.0.1:6443
contexts:
- name: dev
  context:
    cluster: dev-cluster
    user: alice
- name: prod
  context:
    cluster: dev-cluster
    user: bob
users:
- name: alice
  user:
    token: alice-token
    username: alice
    password: wonderland
- name: bob
  user:
    token: bob-token
"#;

    fn modes(modes: &[AuthenticationMode]) -> AuthenticationModes {
        modes.iter().copied().collect()
    }

    #[test]
    fn test_token_and_basic() {
        let a = Authenticator::Token("abc");
        assert_eq!(AuthInfo::token("abc"), a.auth_info().unwrap());

        let a = Authenticator::Basic {
            username: "u",
            password: "p",
        };
        assert_eq!(AuthInfo::basic("u", "p"), a.auth_info().unwrap());
    }

    #[test]
    fn test_kube_config_prefers_token() {
        let modes = modes(&[AuthenticationMode::Token, AuthenticationMode::Basic]);
        let a = Authenticator::KubeConfig {
            kube_config: KUBECONFIG,
            modes: &modes,
        };
        assert_eq!(AuthInfo::token("alice-token"), a.auth_info().unwrap());
    }

    #[test]
    fn test_kube_config_basic_only() {
        let modes = modes(&[AuthenticationMode::Basic]);
        let a = Authenticator::KubeConfig {
            kube_config: KUBECONFIG,
            modes: &modes,
        };
        assert_eq!(AuthInfo::basic("alice", "wonderland"), a.auth_info().unwrap());
    }

    #[test]
    fn test_kube_config_not_enough_data() {
        let config = KUBECONFIG.replace("current-context: dev", "current-context: prod");
        let modes = modes(&[AuthenticationMode::Basic]);
        let a = Authenticator::KubeConfig {
            kube_config: &config,
            modes: &modes,
        };
        assert_eq!(
            Error::invalid("Not enough data to create auth info structure."),
            a.auth_info().unwrap_err()
        );
    }

    #[test]
    fn test_kube_config_unknown_user() {
        let config = KUBECONFIG.replace("user: alice", "user: carol");
        let modes = modes(&[AuthenticationMode::Token]);
        let a = Authenticator::KubeConfig {
            kube_config: &config,
            modes: &modes,
        };
        assert_eq!(
            Error::invalid("auth info was not found for user: carol"),
            a.auth_info().unwrap_err()
        );
    }

    #[test]
    fn test_kube_config_invalid() {
        let modes = modes(&[AuthenticationMode::Token]);

        let missing_context = KUBECONFIG.replace("current-context: dev", "current-context: qa");
        for config in ["{not yaml", missing_context.as_str()] {
            let a = Authenticator::KubeConfig {
                kube_config: config,
                modes: &modes,
            };
            assert!(matches!(a.auth_info(), Err(Error::Invalid(_))), "{config}");
        }
    }
}
