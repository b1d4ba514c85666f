use serde::ser::SerializeStruct;

pub const MSG_TOKEN_EXPIRED_ERROR: &str = "MSG_TOKEN_EXPIRED_ERROR";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The request can't be acted upon, whatever the cluster state.
    Invalid(String),
    Unauthorized(String),
    TokenExpired,
    Forbidden(String),
    NotFound(String),
    AlreadyExists(String),
    Internal(String),
    /// A watch session ended; the payload is the synchronizer name.
    WatchEnded(String),
    /// Continuing would serve requests against inconsistent key material.
    Fatal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Non-critical errors are reported to the caller next to a partial result.
    pub fn is_critical(&self) -> bool {
        !matches!(
            self,
            Self::Unauthorized(_) | Self::TokenExpired | Self::Forbidden(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn status(&self) -> u16 {
        match self {
            Self::Invalid(_) => 400,
            Self::Unauthorized(_) | Self::TokenExpired => 401,
            Self::Forbidden(_) => 403,
            Self::NotFound(_) => 404,
            Self::AlreadyExists(_) => 409,
            Self::Internal(_) | Self::WatchEnded(_) | Self::Fatal(_) => 500,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::Invalid(_) => "Invalid",
            Self::Unauthorized(_) | Self::TokenExpired => "Unauthorized",
            Self::Forbidden(_) => "Forbidden",
            Self::NotFound(_) => "NotFound",
            Self::AlreadyExists(_) => "AlreadyExists",
            Self::Internal(_) | Self::WatchEnded(_) | Self::Fatal(_) => "InternalError",
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid(msg)
            | Self::Unauthorized(msg)
            | Self::Forbidden(msg)
            | Self::NotFound(msg)
            | Self::AlreadyExists(msg)
            | Self::Internal(msg) => f.write_str(msg),
            Self::TokenExpired => f.write_str(MSG_TOKEN_EXPIRED_ERROR),
            Self::WatchEnded(name) => write!(f, "{name} watch ended with timeout"),
            Self::Fatal(msg) => write!(f, "fatal: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl serde::Serialize for Error {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Error", 3)?;
        s.serialize_field("status", &self.status())?;
        s.serialize_field("reason", self.reason())?;
        s.serialize_field("message", &self.to_string())?;
        s.end()
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        let kube::Error::Api(resp) = e else {
            return Self::Internal(e.to_string());
        };
        let msg = resp.message;
        match resp.code {
            400 | 422 => Self::Invalid(msg),
            401 => Self::Unauthorized(msg),
            403 => Self::Forbidden(msg),
            404 => Self::NotFound(msg),
            409 if resp.reason == "AlreadyExists" => Self::AlreadyExists(msg),
            _ => Self::Internal(msg),
        }
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(e: openssl::error::ErrorStack) -> Self {
        Self::Internal(format!("crypto error: {e}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Invalid(format!("malformed payload: {e}"))
    }
}
