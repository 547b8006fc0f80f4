//! Collaborator interfaces.
//!
//! The engine publishes through these traits and never owns a network
//! stack of its own: the host wires in its MQTT client, HTTPS client, and
//! certificate storage at startup.

use anyhow::Result;
use std::time::Duration;

/// TLS material for one HTTPS request.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Use the built-in certificate bundle.
    pub use_bundle: bool,
    /// CA certificate (PEM) from a named certificate set.
    pub ca_pem: Option<Vec<u8>>,
    /// Client certificate (PEM), only together with `client_key_pem`.
    pub client_cert_pem: Option<Vec<u8>>,
    pub client_key_pem: Option<Vec<u8>>,
    /// Skip common-name verification (literal-IP hosts with self-signed certs).
    pub skip_common_name: bool,
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub body: String,
    pub content_type: &'static str,
    pub timeout: Duration,
    /// Pre-built headers, auth included.
    pub headers: Vec<(String, String)>,
    /// None for plain HTTP.
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
    /// True for 2xx statuses.
    pub ok: bool,
}

pub trait HttpClient: Send + Sync {
    fn post(&self, request: &HttpRequest) -> Result<HttpResponse>;
}

pub trait MqttClient: Send + Sync {
    fn publish(&self, topic: &str, payload: &str, qos: u8, retain: bool, dup: bool) -> Result<()>;
}

/// Named certificate set storage.
pub trait CertStore: Send + Sync {
    fn ca(&self, set: &str) -> Option<Vec<u8>>;
    fn client_cert(&self, set: &str) -> Option<Vec<u8>>;
    fn client_key(&self, set: &str) -> Option<Vec<u8>>;
}

/// Expression evaluator for custom/vehicle-specific parameters:
/// `(expression, response bytes, offset) -> value`.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, expression: &str, bytes: &[u8], offset: usize) -> Option<f64>;
}

impl<F> Evaluator for F
where
    F: Fn(&str, &[u8], usize) -> Option<f64> + Send + Sync,
{
    fn evaluate(&self, expression: &str, bytes: &[u8], offset: usize) -> Option<f64> {
        self(expression, bytes, offset)
    }
}

/// Device status document included in the first HTTP(S) publication.
pub trait StatusSource: Send + Sync {
    fn status_json(&self) -> Option<String>;
}

/// A certificate store with no sets; every lookup falls back to the
/// built-in bundle.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCertStore;

impl CertStore for NoCertStore {
    fn ca(&self, _set: &str) -> Option<Vec<u8>> {
        None
    }
    fn client_cert(&self, _set: &str) -> Option<Vec<u8>> {
        None
    }
    fn client_key(&self, _set: &str) -> Option<Vec<u8>> {
        None
    }
}

/// A status source with nothing to report.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoStatusSource;

impl StatusSource for NoStatusSource {
    fn status_json(&self) -> Option<String> {
        None
    }
}
