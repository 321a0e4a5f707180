//! Upstream credential schemes
//!
//! A subscription's secret is classified once, when the registry is built, by a
//! fixed prefix rule: values starting with [`API_KEY_PREFIX`] are API keys and
//! travel in the `x-api-key` header, everything else is treated as an OAuth-style
//! bearer token and travels in `Authorization: Bearer ...`. The header value is
//! precomputed and marked sensitive so it never shows up in debug output.

use std::fmt;

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};

use crate::error::{Error, Result};

/// Prefix that marks a credential as an API key.
pub const API_KEY_PREFIX: &str = "sk-ant-";

/// Header carrying API-key credentials upstream.
pub const API_KEY_HEADER: HeaderName = HeaderName::from_static("x-api-key");

/// A subscription credential, tagged with the header scheme it uses.
#[derive(Clone)]
pub enum Credential {
    Bearer(HeaderValue),
    ApiKey(HeaderValue),
}

impl Credential {
    /// Classify a raw secret and build its header value.
    ///
    /// Fails if the secret is empty or contains bytes that cannot appear in an
    /// HTTP header.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::InvalidDescriptor("credential must not be empty".into()));
        }

        let credential = if raw.starts_with(API_KEY_PREFIX) {
            Credential::ApiKey(sensitive(raw)?)
        } else {
            Credential::Bearer(sensitive(&format!("Bearer {raw}"))?)
        };
        Ok(credential)
    }

    /// Scheme label for logs and status output.
    pub fn scheme(&self) -> &'static str {
        match self {
            Credential::Bearer(_) => "bearer",
            Credential::ApiKey(_) => "api_key",
        }
    }

    /// Header name and value to send upstream.
    pub fn header(&self) -> (HeaderName, HeaderValue) {
        match self {
            Credential::Bearer(value) => (AUTHORIZATION, value.clone()),
            Credential::ApiKey(value) => (API_KEY_HEADER, value.clone()),
        }
    }

    /// Replace any client-supplied credentials in `headers` with this one.
    pub fn apply(&self, headers: &mut HeaderMap) {
        headers.remove(AUTHORIZATION);
        headers.remove(API_KEY_HEADER);
        let (name, value) = self.header();
        headers.insert(name, value);
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential::{}([REDACTED])", self.scheme())
    }
}

fn sensitive(value: &str) -> Result<HeaderValue> {
    let mut header = HeaderValue::from_str(value).map_err(|_| {
        Error::InvalidDescriptor("credential contains characters not allowed in headers".into())
    })?;
    header.set_sensitive(true);
    Ok(header)
}
