use async_trait::async_trait;
use k8s_openapi::api::authorization::v1 as authz;
use kube::api::{Api, PostParams};
use log::debug;

use super::{AuthInfo, ClientManager};
use crate::{Error, Result};

/// Talks to the API server with the credentials of the logged in user.
#[derive(Clone)]
pub struct ClusterClientManager {
    config: kube::Config,
}

impl ClusterClientManager {
    pub fn new(config: kube::Config) -> Self {
        Self { config }
    }

    /// Client using only `auth_info` to authenticate; the process' own credentials are dropped.
    pub fn client(&self, auth_info: &AuthInfo) -> Result<kube::Client> {
        let mut config = self.config.clone();
        config.auth_info = serde_json::from_value(serde_json::to_value(auth_info)?)?;

        kube::Client::try_from(config).map_err(Error::from)
    }

    /// Asks the API server whether `auth_info` may perform `verb` on `resource`.
    pub async fn can_i(
        &self,
        auth_info: &AuthInfo,
        verb: &str,
        resource: &str,
        namespace: Option<&str>,
    ) -> Result<bool> {
        let review = authz::SelfSubjectAccessReview {
            spec: authz::SelfSubjectAccessReviewSpec {
                resource_attributes: Some(authz::ResourceAttributes {
                    verb: Some(verb.to_string()),
                    resource: Some(resource.to_string()),
                    namespace: namespace.map(str::to_string),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };

        let api = Api::<authz::SelfSubjectAccessReview>::all(self.client(auth_info)?);
        let review = api.create(&PostParams::default(), &review).await?;

        let allowed = review.status.is_some_and(|s| s.allowed);
        debug!("access review for {verb} {resource}: allowed={allowed}");
        Ok(allowed)
    }
}

#[async_trait]
impl ClientManager for ClusterClientManager {
    async fn has_access(&self, auth_info: &AuthInfo) -> Result<()> {
        // any answer means the API server accepted the credential
        self.can_i(auth_info, "get", "namespaces", None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn manager() -> ClusterClientManager {
        let url = "https://127.0.0.1:6443".parse().unwrap();
        ClusterClientManager::new(kube::Config::new(url))
    }

    #[tokio::test]
    async fn test_client_uses_user_credentials() {
        let manager = manager();
        assert!(manager.client(&AuthInfo::token("abc")).is_ok());
        assert!(manager.client(&AuthInfo::basic("admin", "secret")).is_ok());
    }

    #[test]
    fn test_auth_info_conversion() {
        let info = AuthInfo::basic("admin", "secret");
        let kube_info: kube::config::AuthInfo =
            serde_json::from_value(serde_json::to_value(&info).unwrap()).unwrap();
        assert_eq!(Some("admin".to_string()), kube_info.username);
        assert!(kube_info.password.is_some());
        assert!(kube_info.token.is_none());
    }
}
