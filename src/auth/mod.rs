//! Bearer credential supply.
//!
//! Token acquisition, refresh and encrypted storage happen outside this crate;
//! the fetcher only ever asks for the current token string.

/// Supplies the access token attached to every Graph API request.
pub trait CredentialProvider: Send + Sync {
    /// Current token. An empty string means no credential is available.
    fn access_token(&self) -> String;
}

/// Reads the token from an environment variable on every call, so a token
/// rotated by an external refresher is picked up without a restart.
pub struct EnvCredentials {
    var: String,
}

impl EnvCredentials {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl CredentialProvider for EnvCredentials {
    fn access_token(&self) -> String {
        std::env::var(&self.var).unwrap_or_default()
    }
}
