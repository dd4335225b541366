//! Proxy authentication middleware
//!
//! Handles Basic authentication for the proxy server.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hyper::header::PROXY_AUTHORIZATION;
use hyper::Request;
use tracing::{debug, warn};

use crate::error::{EgretError, Result};

/// Proxy authentication handler
#[derive(Clone)]
pub struct ProxyAuth {
    /// Expected credentials; None disables authentication
    credentials: Option<(String, String)>,
}

impl ProxyAuth {
    /// Create a new proxy auth handler
    pub fn new(credentials: Option<(String, String)>) -> Self {
        Self { credentials }
    }

    /// Create a disabled auth handler
    pub fn disabled() -> Self {
        Self { credentials: None }
    }

    /// Check if authentication is enabled
    pub fn is_enabled(&self) -> bool {
        self.credentials.is_some()
    }

    /// Validate the Proxy-Authorization header
    pub fn validate<T>(&self, req: &Request<T>, remote: &str) -> Result<()> {
        let (username, password) = match &self.credentials {
            Some(creds) => creds,
            None => return Ok(()),
        };

        let auth_header = req
            .headers()
            .get(PROXY_AUTHORIZATION)
            .ok_or(EgretError::AuthenticationFailed)?;

        let auth_str = auth_header
            .to_str()
            .map_err(|_| EgretError::AuthenticationFailed)?;

        // Parse "Basic <base64>"
        let encoded = auth_str
            .strip_prefix("Basic ")
            .ok_or(EgretError::AuthenticationFailed)?;

        let decoded = BASE64
            .decode(encoded)
            .map_err(|_| EgretError::AuthenticationFailed)?;

        let credentials =
            String::from_utf8(decoded).map_err(|_| EgretError::AuthenticationFailed)?;

        // The password may contain colons; only the first one separates
        let (user, pass) = credentials
            .split_once(':')
            .ok_or(EgretError::AuthenticationFailed)?;

        let user_match = constant_time_eq(user.as_bytes(), username.as_bytes());
        let pass_match = constant_time_eq(pass.as_bytes(), password.as_bytes());
        if user_match & pass_match {
            debug!(user, "proxy authentication successful");
            Ok(())
        } else {
            warn!(user, remote, "proxy authentication failed");
            Err(EgretError::AuthenticationFailed)
        }
    }
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut acc: u8 = 0;
    for (&x, &y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}
