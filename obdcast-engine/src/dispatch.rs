//! Destination dispatcher: fans snapshots out to every configured sink.
//!
//! Runs on its own thread at a short tick. Each destination keeps its own
//! cadence; repeated HTTP/ABRP failures stretch the cadence with an
//! exponential backoff (floor 30 s for plain HTTP endpoints, 60 s for
//! ABRP) capped at twice the base cycle.

use crate::abrp;
use crate::config::{Destination, DestinationAuth, DestinationKind};
use crate::io::{CertStore, HttpClient, HttpRequest, MqttClient, StatusSource, TlsConfig};
use crate::status::DeviceStatus;
use crate::store::ParameterStore;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::{error, info, warn};
use serde_json::{Map, Value};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Dispatcher poll tick.
pub const TICK: Duration = Duration::from_millis(100);
/// Yield between destinations after network work.
const DESTINATION_YIELD: Duration = Duration::from_millis(5);
/// POST timeout for HTTP/HTTPS/ABRP endpoints.
const POST_TIMEOUT: Duration = Duration::from_secs(2);
/// Failures before backoff engages.
const BACKOFF_THRESHOLD: u32 = 3;
pub const HTTP_BACKOFF_FLOOR_MS: u64 = 30_000;
pub const ABRP_BACKOFF_FLOOR_MS: u64 = 60_000;

pub struct DispatcherDeps {
    pub store: Arc<ParameterStore>,
    pub status: Arc<DeviceStatus>,
    pub mqtt: Arc<dyn MqttClient>,
    pub http: Arc<dyn HttpClient>,
    pub certs: Arc<dyn CertStore>,
    pub status_source: Arc<dyn StatusSource>,
    /// Topic used when a destination names none.
    pub default_mqtt_topic: Option<String>,
}

pub struct Dispatcher {
    deps: DispatcherDeps,
    destinations: Vec<Destination>,
    grouping_enabled: bool,
    /// The first successful HTTP(S) post carries the full settings
    /// wrapper; afterwards only telemetry is sent.
    settings_sent: bool,
}

impl Dispatcher {
    pub fn new(deps: DispatcherDeps, destinations: Vec<Destination>, grouping_enabled: bool) -> Self {
        Self {
            deps,
            destinations,
            grouping_enabled,
            settings_sent: false,
        }
    }

    /// Run the dispatch loop on its own thread.
    pub fn start(mut self) -> JoinHandle<()> {
        crate::thread_util::spawn_named("obd_dispatch", move || {
            info!("Dispatcher task started");
            loop {
                if self.deps.status.shutdown_requested() {
                    break;
                }
                if self.deps.status.is_enabled() && !self.deps.status.is_sleeping() {
                    self.tick(Instant::now());
                }
                std::thread::sleep(TICK);
            }
            info!("Dispatcher task stopped");
        })
    }

    /// One dispatch pass over all destinations.
    pub fn tick(&mut self, now: Instant) {
        if !self.grouping_enabled {
            return;
        }
        let Some(raw_json) = self.deps.store.snapshot_json() else {
            return;
        };

        for index in 0..self.destinations.len() {
            let dest = &mut self.destinations[index];
            if !dest.enabled {
                continue;
            }

            let effective_cycle_ms = dest.cycle_ms.max(dest.backoff_ms);
            if effective_cycle_ms > 0 {
                if let Some(due) = dest.next_due_at {
                    if now < due {
                        continue;
                    }
                }
            }

            match dest.kind {
                DestinationKind::MqttTopic | DestinationKind::MqttWallbox | DestinationKind::Default => {
                    let topic = if dest.target.is_empty() {
                        self.deps.default_mqtt_topic.clone()
                    } else {
                        Some(dest.target.clone())
                    };
                    match topic {
                        Some(topic) => {
                            if let Err(e) = self.deps.mqtt.publish(&topic, &raw_json, 0, true, false)
                            {
                                error!("MQTT publish to {topic} failed: {e}");
                            } else {
                                info!("Published MQTT ({}) to {topic}", dest.kind.as_str());
                            }
                        }
                        None => warn!("Destination {index} has no topic and no default"),
                    }
                }
                DestinationKind::Http | DestinationKind::Https => {
                    if dest.target.is_empty() {
                        warn!("Destination {index} missing URL");
                    } else {
                        let ok = publish_http(
                            &self.deps,
                            dest,
                            self.settings_sent,
                            &raw_json,
                        );
                        if ok {
                            info!("HTTP(S) dest {index} publish succeeded");
                            dest.consecutive_failures = 0;
                            dest.backoff_ms = 0;
                            self.settings_sent = true;
                        } else {
                            dest.consecutive_failures += 1;
                            if dest.consecutive_failures >= BACKOFF_THRESHOLD {
                                dest.backoff_ms = next_backoff(
                                    dest.backoff_ms,
                                    dest.base_cycle_ms(),
                                    HTTP_BACKOFF_FLOOR_MS,
                                );
                                warn!(
                                    "HTTP(S) dest {index} failed {} times, backoff {} ms",
                                    dest.consecutive_failures, dest.backoff_ms
                                );
                            }
                        }
                    }
                }
                DestinationKind::Abrp => {
                    if dest.target.is_empty() {
                        warn!("Destination {index} missing URL");
                    } else {
                        let ok = publish_abrp(&self.deps, dest, &raw_json);
                        if ok {
                            dest.consecutive_failures = 0;
                            dest.backoff_ms = 0;
                        } else {
                            dest.consecutive_failures += 1;
                            if dest.consecutive_failures >= BACKOFF_THRESHOLD {
                                dest.backoff_ms = next_backoff(
                                    dest.backoff_ms,
                                    dest.base_cycle_ms(),
                                    ABRP_BACKOFF_FLOOR_MS,
                                );
                                warn!(
                                    "ABRP dest {index} failed {} times, backoff {} ms",
                                    dest.consecutive_failures, dest.backoff_ms
                                );
                            }
                        }
                    }
                }
            }

            let dest = &mut self.destinations[index];
            let effective_cycle_ms = dest.cycle_ms.max(dest.backoff_ms);
            dest.next_due_at = Some(now + Duration::from_millis(effective_cycle_ms));

            std::thread::sleep(DESTINATION_YIELD);
        }
    }

    #[cfg(test)]
    fn destination(&self, index: usize) -> &Destination {
        &self.destinations[index]
    }
}

/// Exponential backoff with a floor and a cap of twice the base cycle.
///
/// The floor applies before the cap, so the very first backoff is at
/// least the floor even for short cycles.
pub fn next_backoff(current_ms: u64, base_cycle_ms: u64, floor_ms: u64) -> u64 {
    let mut next = if current_ms > 0 { current_ms } else { base_cycle_ms };
    if next < floor_ms {
        next *= 2;
    }
    if next < floor_ms {
        next = floor_ms;
    }
    let cap = (base_cycle_ms * 2).max(floor_ms);
    next.min(cap)
}

/// Unix seconds for the ABRP `utc` field.
fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn parse_or_empty(json: Option<&str>) -> Value {
    json.and_then(|text| serde_json::from_str(text).ok())
        .unwrap_or_else(|| Value::Object(Map::new()))
}

/// Telemetry body for HTTP(S): the full settings wrapper on the first
/// post, `{"autopid_data": ...}` afterwards.
fn http_body(deps: &DispatcherDeps, settings_sent: bool, raw_json: &str) -> String {
    let mut root = Map::new();
    if !settings_sent {
        root.insert(
            "config".to_string(),
            parse_or_empty(deps.store.config_json().as_deref()),
        );
        root.insert(
            "status".to_string(),
            parse_or_empty(deps.status_source.status_json().as_deref()),
        );
    }
    root.insert("autopid_data".to_string(), parse_or_empty(Some(raw_json)));
    Value::Object(root).to_string()
}

fn publish_http(
    deps: &DispatcherDeps,
    dest: &Destination,
    settings_sent: bool,
    raw_json: &str,
) -> bool {
    let body = http_body(deps, settings_sent, raw_json);
    let mut url = dest.target.clone();
    let mut headers = Vec::new();
    apply_auth(dest, &mut url, &mut headers);

    let tls = url
        .to_ascii_lowercase()
        .starts_with("https://")
        .then(|| tls_config(deps.certs.as_ref(), dest, &url));

    let request = HttpRequest {
        url,
        body,
        content_type: "application/json",
        timeout: POST_TIMEOUT,
        headers,
        tls,
    };
    match deps.http.post(&request) {
        Ok(response) => {
            if !response.ok {
                error!("HTTP(S) post to {} returned {}", request.url, response.status);
            }
            response.ok
        }
        Err(e) => {
            error!("HTTP(S) post to {} failed: {e}", request.url);
            false
        }
    }
}

fn publish_abrp(deps: &DispatcherDeps, dest: &Destination, raw_json: &str) -> bool {
    let Some(tlm) = abrp::build_payload(raw_json, now_unix()) else {
        error!("Failed to build ABRP telemetry data");
        return false;
    };
    let body = abrp::form_body(dest.api_token.as_deref(), &tlm);

    // ABRP is always HTTPS with the built-in bundle
    let tls = TlsConfig {
        use_bundle: true,
        skip_common_name: host_is_ipv4_literal(&dest.target),
        ..TlsConfig::default()
    };
    let request = HttpRequest {
        url: dest.target.clone(),
        body,
        content_type: "application/x-www-form-urlencoded",
        timeout: POST_TIMEOUT,
        headers: Vec::new(),
        tls: Some(tls),
    };
    match deps.http.post(&request) {
        Ok(response) => {
            let ok = response.ok && abrp::is_logical_success(&response.body);
            if !ok {
                warn!(
                    "ABRP post to {} rejected: status {}, body {:?}",
                    request.url, response.status, response.body
                );
            }
            ok
        }
        Err(e) => {
            error!("ABRP post to {} failed: {e}", request.url);
            false
        }
    }
}

/// Resolve the TLS material for a destination.
fn tls_config(certs: &dyn CertStore, dest: &Destination, url: &str) -> TlsConfig {
    let mut tls = TlsConfig::default();
    if dest.cert_set != "default" {
        match certs.ca(&dest.cert_set) {
            Some(ca) => {
                info!("Using CA cert from set '{}' for HTTPS", dest.cert_set);
                tls.ca_pem = Some(ca);
            }
            None => {
                warn!(
                    "No CA cert in set '{}', using built-in bundle for HTTPS",
                    dest.cert_set
                );
                tls.use_bundle = true;
            }
        }
        if let (Some(cert), Some(key)) = (
            certs.client_cert(&dest.cert_set),
            certs.client_key(&dest.cert_set),
        ) {
            info!("Using client cert+key from set '{}' for HTTPS", dest.cert_set);
            tls.client_cert_pem = Some(cert);
            tls.client_key_pem = Some(key);
        }
    } else {
        tls.use_bundle = true;
    }
    // Self-signed certificates on literal-IP hosts never match a name
    tls.skip_common_name = host_is_ipv4_literal(url);
    tls
}

/// True when the URL's host is a literal IPv4 address.
pub fn host_is_ipv4_literal(url: &str) -> bool {
    let host = url
        .split_once("://")
        .map_or(url, |(_, rest)| rest)
        .split(['/', ':'])
        .next()
        .unwrap_or("");
    host.parse::<Ipv4Addr>().is_ok()
}

fn append_query(url: &mut String, key: &str, value: &str) {
    let sep = if url.contains('?') { '&' } else { '?' };
    url.push(sep);
    url.push_str(key);
    url.push('=');
    url.push_str(value);
}

/// Attach the destination's auth to the request: headers for bearer,
/// api-key-header and basic; query parameters for api-key-query, plus any
/// extra configured query parameters.
fn apply_auth(dest: &Destination, url: &mut String, headers: &mut Vec<(String, String)>) {
    match &dest.auth {
        DestinationAuth::None => {}
        DestinationAuth::Bearer { token } => {
            headers.push(("Authorization".to_string(), format!("Bearer {token}")));
        }
        DestinationAuth::ApiKeyHeader { header_name, key } => {
            let name = header_name.as_deref().unwrap_or("x-api-key");
            headers.push((name.to_string(), key.clone()));
        }
        DestinationAuth::ApiKeyQuery { query_name, key } => {
            append_query(url, query_name, key);
        }
        DestinationAuth::Basic { username, password } => {
            let credentials = BASE64.encode(format!("{username}:{password}"));
            headers.push(("Authorization".to_string(), format!("Basic {credentials}")));
        }
    }
    for (key, value) in &dest.query_params {
        append_query(url, key, value);
    }
}
