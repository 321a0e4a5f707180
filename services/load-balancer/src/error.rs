//! Service-level error types
//!
//! Per-request failures never become Rust errors; the proxy handler renders them
//! as JSON responses directly. These variants cover startup only.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Subscription pool error: {0}")]
    Pool(#[from] subscription_pool::Error),
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_includes_context() {
        let config_err = Error::Config("missing field".into());
        assert_eq!(config_err.to_string(), "Configuration error: missing field");

        let io_err = Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "file not found",
        ));
        assert!(
            io_err.to_string().starts_with("I/O error:"),
            "got: {io_err}"
        );
    }

    #[test]
    fn pool_errors_convert() {
        let err: Error = subscription_pool::Error::DuplicateSubscription("primary".into()).into();
        assert_eq!(
            err.to_string(),
            "Subscription pool error: duplicate subscription name: primary"
        );
    }
}
