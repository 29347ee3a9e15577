//! Shared HTTP client construction (timeouts, optional TLS).

use crate::models::{ConfigError, LodeError, Result, SecurityConfig};
use std::path::Path;
use std::time::Duration;

fn read_pem(path: &Path) -> std::result::Result<Vec<u8>, ConfigError> {
    std::fs::read(path).map_err(|e| ConfigError::Tls {
        path: path.to_owned(),
        reason: e.to_string(),
    })
}

/// Build a reqwest client with the configured timeout and TLS material.
///
/// Every remote call made through it carries a deadline, so a hung node
/// surfaces as a timeout error instead of blocking the command.
pub fn build_http_client(security: &SecurityConfig, timeout: Duration) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)));

    if let Some(ca_path) = &security.ca_path {
        let pem = read_pem(ca_path)?;
        let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| ConfigError::Tls {
            path: ca_path.clone(),
            reason: e.to_string(),
        })?;
        builder = builder.add_root_certificate(cert).use_rustls_tls();
    }

    if let (Some(cert_path), Some(key_path)) = (&security.cert_path, &security.key_path) {
        let mut pem = read_pem(cert_path)?;
        pem.extend_from_slice(b"\n");
        pem.extend_from_slice(&read_pem(key_path)?);
        let identity = reqwest::Identity::from_pem(&pem).map_err(|e| ConfigError::Tls {
            path: cert_path.clone(),
            reason: e.to_string(),
        })?;
        builder = builder.identity(identity);
    }

    builder.build().map_err(LodeError::Network)
}

/// `scheme://addr` for a host:port address.
pub fn base_url(security: &SecurityConfig, addr: &str) -> String {
    let addr = addr.trim_end_matches('/');
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("{}://{}", security.scheme(), addr)
    }
}

/// Turn a transport error into the error kind callers act on.
pub(crate) fn classify(what: &str, err: reqwest::Error) -> LodeError {
    if err.is_connect() {
        LodeError::unavailable(what.to_string(), err)
    } else {
        LodeError::Network(err)
    }
}

/// Fail with `Remote` unless the response status is a success.
pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(LodeError::Remote {
        status: status.as_u16(),
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_base_url_scheme() {
        let plain = SecurityConfig::default();
        assert_eq!(base_url(&plain, "10.0.0.1:2379"), "http://10.0.0.1:2379");
        assert_eq!(base_url(&plain, "https://pd:2379/"), "https://pd:2379");

        let tls = SecurityConfig {
            ca_path: Some(PathBuf::from("/etc/ca.pem")),
            ..Default::default()
        };
        assert_eq!(base_url(&tls, "pd:2379"), "https://pd:2379");
    }

    #[test]
    fn test_missing_ca_is_config_error() {
        let tls = SecurityConfig {
            ca_path: Some(PathBuf::from("/nonexistent/ca.pem")),
            ..Default::default()
        };
        let err = build_http_client(&tls, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, LodeError::Config(ConfigError::Tls { .. })));
    }
}
