use k8s_openapi::apimachinery::pkg::apis::meta::v1 as meta;

pub mod api;
pub mod auth;
pub mod errors;
pub mod sync;

pub use errors::{Error, Result};

/// Name of the secret holding the token encryption key, shared by every replica.
pub const ENCRYPTION_KEY_HOLDER_NAME: &str = "kubernetes-dashboard-key-holder";

/// Request header carrying the session token.
pub const JWE_TOKEN_HEADER: &str = "jweToken";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}
impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn metadata(&self) -> meta::ObjectMeta {
        meta::ObjectMeta {
            namespace: Some(self.namespace.clone()),
            name: Some(self.name.clone()),
            ..Default::default()
        }
    }
}
impl TryFrom<&meta::ObjectMeta> for ObjectKey {
    type Error = &'static str;
    fn try_from(metadata: &meta::ObjectMeta) -> std::result::Result<Self, Self::Error> {
        Ok(Self {
            namespace: metadata.namespace.clone().ok_or("no namespace")?,
            name: metadata.name.clone().ok_or("no name")?,
        })
    }
}
impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::result::Result<(), std::fmt::Error> {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
