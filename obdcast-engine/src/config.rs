//! Configuration model: the canonical form the engine runs on.
//!
//! The on-disk JSON (written by the provisioning UI) is parsed into raw
//! serde structs and normalized once at load time: semicolon-separated
//! init strings become command lists, `ATSP` becomes `ATTP`, bare URLs get
//! their scheme, the legacy single-destination fields fold into
//! `destinations[]`, and standard parameters resolve their table signals.
//! Nothing is rewritten during scheduling.

use anyhow::{bail, Context, Result};
use indexmap::IndexSet;
use log::warn;
use obdcast_standard_pids::{command_for_name, get_pid_for_name, StdParameter};
use serde::Deserialize;
use std::time::{Duration, Instant};

/// Publish/poll cycle applied when the configuration gives none.
pub const DEFAULT_CYCLE_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorType {
    #[default]
    #[serde(alias = "sensor")]
    Numeric,
    Binary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PidKind {
    Standard,
    Custom,
    Specific,
}

/// Where a snapshot or single parameter is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DestinationKind {
    #[default]
    Default,
    MqttTopic,
    MqttWallbox,
    Http,
    Https,
    Abrp,
}

impl DestinationKind {
    /// Parse the configuration's type string; unknown values fall back to
    /// the default MQTT topic.
    pub fn from_config_str(s: &str) -> Self {
        match s {
            "MQTT_Topic" => Self::MqttTopic,
            "MQTT_WallBox" => Self::MqttWallbox,
            "HTTP" => Self::Http,
            "HTTPS" => Self::Https,
            "ABRP_API" => Self::Abrp,
            _ => Self::Default,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MqttTopic => "MQTT_Topic",
            Self::MqttWallbox => "MQTT_WallBox",
            Self::Http => "HTTP",
            Self::Https => "HTTPS",
            Self::Abrp => "ABRP_API",
            Self::Default => "Default",
        }
    }

    pub fn is_mqtt(self) -> bool {
        matches!(self, Self::Default | Self::MqttTopic | Self::MqttWallbox)
    }
}

/// HTTP(S) destination authentication, resolved at load time.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DestinationAuth {
    #[default]
    None,
    Bearer {
        token: String,
    },
    ApiKeyHeader {
        header_name: Option<String>,
        key: String,
    },
    ApiKeyQuery {
        query_name: String,
        key: String,
    },
    Basic {
        username: String,
        password: String,
    },
}

/// A canonical, CR-terminated command sequence.
///
/// Built once at config load; the scheduler only iterates it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandList {
    commands: Vec<String>,
}

impl CommandList {
    /// Split a user string on `;` / CR into individual commands.
    pub fn parse(raw: &str) -> Self {
        let commands = raw
            .split([';', '\r', '\n'])
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(|c| format!("{c}\r"))
            .collect();
        Self { commands }
    }

    /// Like [`CommandList::parse`], additionally rewriting `ATSP` to
    /// `ATTP` so user init strings select the protocol without triggering
    /// a bus search.
    pub fn parse_with_attp_rewrite(raw: &str) -> Self {
        Self::parse(&raw.replace("ATSP", "ATTP"))
    }

    pub fn single(command: &str) -> Self {
        Self::parse(command)
    }

    pub fn from_commands(commands: Vec<String>) -> Self {
        Self {
            commands: commands
                .into_iter()
                .map(|c| if c.ends_with('\r') { c } else { format!("{c}\r") })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.commands.iter().map(String::as_str)
    }
}

/// One named physical quantity exposed to sinks.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: String,
    pub sensor_type: SensorType,
    pub unit: Option<String>,
    pub class: Option<String>,
    pub period: Duration,
    /// Validity window; `None` means unconstrained.
    pub min: Option<f32>,
    pub max: Option<f32>,
    /// Byte-array expression for custom/vehicle-specific parameters.
    pub expression: Option<String>,
    /// Per-parameter sink override.
    pub destination: Option<String>,
    pub destination_kind: DestinationKind,
    /// Resolved table signal for standard parameters.
    pub std_signal: Option<&'static StdParameter>,
    // Transient polling state, mutated by the scheduler only
    pub last_value: Option<f64>,
    pub failed: bool,
    pub next_due_at: Option<Instant>,
}

impl Parameter {
    pub fn is_due(&self, now: Instant) -> bool {
        self.next_due_at.map_or(true, |due| now >= due)
    }

    /// Schedule from `now`, not from the previous deadline: a slow reply
    /// must not cause catch-up bursts.
    pub fn schedule_next(&mut self, now: Instant) {
        self.next_due_at = Some(now + self.period);
    }
}

/// A group of parameters sharing one adapter transaction.
#[derive(Debug, Clone)]
pub struct PidEntry {
    pub kind: PidKind,
    /// The line sent to the adapter, CR-terminated.
    pub cmd: String,
    /// Per-entry AT preamble (custom/specific only).
    pub init: CommandList,
    /// Receive filter header, used for the standard init's ATCRA.
    pub rxheader: Option<String>,
    pub parameters: Vec<Parameter>,
}

/// One outbound sink with its transient dispatch state.
#[derive(Debug, Clone)]
pub struct Destination {
    pub kind: DestinationKind,
    pub target: String,
    pub cycle_ms: u64,
    pub enabled: bool,
    pub cert_set: String,
    pub api_token: Option<String>,
    pub auth: DestinationAuth,
    pub query_params: Vec<(String, String)>,
    // Transient dispatch state, mutated by the dispatcher only
    pub next_due_at: Option<Instant>,
    pub consecutive_failures: u32,
    pub backoff_ms: u64,
}

impl Destination {
    /// Cycle used as the backoff base; an unset cycle counts as the
    /// default so backoff floors still apply.
    pub fn base_cycle_ms(&self) -> u64 {
        if self.cycle_ms > 0 {
            self.cycle_ms
        } else {
            DEFAULT_CYCLE_MS
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StandardProtocol {
    Auto,
    Fixed(u8),
}

impl StandardProtocol {
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("auto") || s == "0" {
            return Self::Auto;
        }
        match u8::from_str_radix(s, 16) {
            Ok(p) if p <= 0x0C => Self::Fixed(p),
            _ => {
                warn!("Invalid ECU protocol {s:?}, falling back to auto");
                Self::Auto
            }
        }
    }
}

/// ATSH value for the standard functional request, per protocol.
pub fn sh_for_protocol(protocol: u8) -> Option<&'static str> {
    match protocol {
        6 | 8 => Some("7DF"),
        7 | 9 => Some("18DB33F1"),
        _ => None,
    }
}

fn standard_init_commands(protocol: u8, rxheader: Option<&str>) -> CommandList {
    match sh_for_protocol(protocol) {
        Some(sh) => {
            let cra = match rxheader {
                Some(rx) if !rx.is_empty() => format!("ATCRA{rx}"),
                _ => "ATCRA".to_string(),
            };
            CommandList::from_commands(vec![
                format!("ATTP{protocol:X}"),
                format!("ATSH{sh}"),
                cra,
            ])
        }
        None => CommandList::single("ATTP0"),
    }
}

/// The full engine configuration in canonical form.
#[derive(Debug, Clone)]
pub struct AllPids {
    pub entries: Vec<PidEntry>,
    pub destinations: Vec<Destination>,
    pub grouping_enabled: bool,
    pub custom_init: CommandList,
    pub standard_init: CommandList,
    pub specific_init: CommandList,
    pub standard_protocol: StandardProtocol,
    pub standard_enabled: bool,
    pub custom_enabled: bool,
    pub specific_enabled: bool,
    pub car_model: Option<String>,
}

impl AllPids {
    pub fn kind_enabled(&self, kind: PidKind) -> bool {
        match kind {
            PidKind::Standard => self.standard_enabled,
            PidKind::Custom => self.custom_enabled,
            PidKind::Specific => self.specific_enabled,
        }
    }

    /// After the adapter reports its auto-negotiated protocol, pin it.
    pub fn rebuild_standard_init(&mut self, protocol: u8) {
        self.standard_init = CommandList::single(&format!("ATTP{protocol:X}"));
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let raw: RawConfig = serde_json::from_str(text).context("Failed to parse config JSON")?;
        raw.normalize()
    }
}

/// Prefix bare HTTP/HTTPS/ABRP targets with their scheme.
pub fn normalize_url(kind: DestinationKind, target: &str) -> String {
    if kind.is_mqtt()
        || target.starts_with("http://")
        || target.starts_with("https://")
        || target.is_empty()
    {
        return target.to_string();
    }
    let scheme = match kind {
        DestinationKind::Http => "http://",
        _ => "https://",
    };
    format!("{scheme}{target}")
}

// ---------------------------------------------------------------------------
// Raw on-disk shapes

/// Cycle/period values appear both as numbers and as strings in the wild.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum MsValue {
    Number(u64),
    Text(String),
}

impl MsValue {
    fn ms(&self) -> Option<u64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }
}

fn enabled_flag(value: Option<&String>, default: bool) -> bool {
    value.map_or(default, |v| v == "enable")
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    initialisation: Option<String>,
    #[serde(default)]
    specific_init: Option<String>,
    #[serde(default)]
    grouping: Option<String>,
    #[serde(default)]
    car_model: Option<String>,
    #[serde(default)]
    ecu_protocol: Option<String>,
    #[serde(default)]
    cycle: Option<MsValue>,
    #[serde(default)]
    standard_pids: Option<String>,
    #[serde(default)]
    custom_pids: Option<String>,
    #[serde(default)]
    car_specific: Option<String>,
    #[serde(default)]
    pids: Vec<RawPidEntry>,
    #[serde(default)]
    std_pids: Vec<RawStdPid>,
    #[serde(default)]
    destinations: Vec<RawDestination>,
    // Legacy single destination
    #[serde(default)]
    destination: Option<String>,
    #[serde(default)]
    group_dest_type: Option<String>,
    #[serde(default)]
    group_api_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPidEntry {
    pid: String,
    #[serde(default)]
    pid_init: Option<String>,
    #[serde(default)]
    rxheader: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    parameters: Vec<RawParameter>,
}

#[derive(Debug, Deserialize)]
struct RawParameter {
    name: String,
    #[serde(default)]
    expression: Option<String>,
    #[serde(default)]
    unit: Option<String>,
    #[serde(default)]
    class: Option<String>,
    #[serde(default)]
    sensor_type: Option<SensorType>,
    #[serde(default)]
    period: Option<MsValue>,
    #[serde(default)]
    min: Option<f32>,
    #[serde(default)]
    max: Option<f32>,
    #[serde(default)]
    destination: Option<String>,
    #[serde(default)]
    destination_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStdPid {
    name: String,
    #[serde(default)]
    period: Option<MsValue>,
    #[serde(default)]
    rxheader: Option<String>,
    #[serde(default)]
    sensor_type: Option<SensorType>,
    #[serde(default)]
    destination: Option<String>,
    #[serde(default)]
    destination_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawQueryParam {
    key: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Default, Deserialize)]
struct RawAuth {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    bearer: Option<String>,
    #[serde(default)]
    api_key_header_name: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    api_key_query_name: Option<String>,
    #[serde(default)]
    basic_username: Option<String>,
    #[serde(default)]
    basic_password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawDestination {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    destination: Option<String>,
    #[serde(default)]
    cycle: Option<MsValue>,
    #[serde(default)]
    api_token: Option<String>,
    #[serde(default)]
    cert_set: Option<String>,
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    auth: Option<RawAuth>,
    #[serde(default)]
    query_params: Vec<RawQueryParam>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

impl RawAuth {
    fn resolve(&self) -> DestinationAuth {
        match self.kind.as_deref() {
            Some("bearer") => match non_empty(self.bearer.clone()) {
                Some(token) => DestinationAuth::Bearer { token },
                None => DestinationAuth::None,
            },
            Some("api_key_header") => match non_empty(self.api_key.clone()) {
                Some(key) => DestinationAuth::ApiKeyHeader {
                    header_name: non_empty(self.api_key_header_name.clone()),
                    key,
                },
                None => DestinationAuth::None,
            },
            Some("api_key_query") => {
                match (
                    non_empty(self.api_key.clone()),
                    non_empty(self.api_key_query_name.clone()),
                ) {
                    (Some(key), Some(query_name)) => {
                        DestinationAuth::ApiKeyQuery { query_name, key }
                    }
                    _ => DestinationAuth::None,
                }
            }
            Some("basic") => DestinationAuth::Basic {
                username: self.basic_username.clone().unwrap_or_default(),
                password: self.basic_password.clone().unwrap_or_default(),
            },
            _ => DestinationAuth::None,
        }
    }
}

impl RawDestination {
    fn resolve(self, default_cycle_ms: u64) -> Destination {
        let kind = self
            .kind
            .as_deref()
            .map(DestinationKind::from_config_str)
            .unwrap_or_default();
        let target = normalize_url(kind, self.destination.as_deref().unwrap_or(""));
        let api_token = non_empty(self.api_token);

        let auth = match &self.auth {
            Some(raw) => raw.resolve(),
            // Back-compat: an api_token on an HTTP(S) destination is a
            // bearer token
            None => match (&kind, &api_token) {
                (DestinationKind::Http | DestinationKind::Https, Some(token)) => {
                    DestinationAuth::Bearer {
                        token: token.clone(),
                    }
                }
                _ => DestinationAuth::None,
            },
        };

        // ABRP carries its token in the form body and always uses the
        // built-in bundle
        let cert_set = if kind == DestinationKind::Abrp {
            "default".to_string()
        } else {
            self.cert_set.unwrap_or_else(|| "default".to_string())
        };

        Destination {
            kind,
            target,
            cycle_ms: self
                .cycle
                .as_ref()
                .and_then(MsValue::ms)
                .unwrap_or(default_cycle_ms),
            enabled: self.enabled.unwrap_or(true),
            cert_set,
            api_token,
            auth,
            query_params: self
                .query_params
                .into_iter()
                .map(|qp| (qp.key, qp.value))
                .collect(),
            next_due_at: None,
            consecutive_failures: 0,
            backoff_ms: 0,
        }
    }
}

impl RawConfig {
    fn normalize(self) -> Result<AllPids> {
        let default_cycle_ms = self
            .cycle
            .as_ref()
            .and_then(MsValue::ms)
            .unwrap_or(DEFAULT_CYCLE_MS);

        let custom_init = self
            .initialisation
            .as_deref()
            .map(CommandList::parse_with_attp_rewrite)
            .unwrap_or_default();
        let specific_init = self
            .specific_init
            .as_deref()
            .map(CommandList::parse)
            .unwrap_or_default();

        let standard_protocol = StandardProtocol::parse(self.ecu_protocol.as_deref().unwrap_or(""));

        let mut names: IndexSet<String> = IndexSet::new();
        let mut entries = Vec::new();

        for raw in self.pids {
            let kind = match raw.kind.as_deref() {
                Some("specific" | "car_specific") => PidKind::Specific,
                _ => PidKind::Custom,
            };
            let mut parameters = Vec::new();
            for p in raw.parameters {
                if !names.insert(p.name.clone()) {
                    bail!("Duplicate parameter name: {}", p.name);
                }
                parameters.push(Parameter {
                    name: p.name,
                    sensor_type: p.sensor_type.unwrap_or_default(),
                    unit: non_empty(p.unit),
                    class: non_empty(p.class),
                    period: Duration::from_millis(
                        p.period
                            .as_ref()
                            .and_then(MsValue::ms)
                            .unwrap_or(default_cycle_ms),
                    ),
                    min: p.min,
                    max: p.max,
                    expression: non_empty(p.expression),
                    destination: non_empty(p.destination),
                    destination_kind: p
                        .destination_type
                        .as_deref()
                        .map(DestinationKind::from_config_str)
                        .unwrap_or_default(),
                    std_signal: None,
                    last_value: None,
                    failed: false,
                    next_due_at: None,
                });
            }
            let mut cmd = raw.pid.trim().to_string();
            if cmd.is_empty() {
                bail!("PID entry with empty command");
            }
            cmd.push('\r');
            entries.push(PidEntry {
                kind,
                cmd,
                init: raw
                    .pid_init
                    .as_deref()
                    .map(CommandList::parse)
                    .unwrap_or_default(),
                rxheader: non_empty(raw.rxheader),
                parameters,
            });
        }

        // Standard parameters resolve against the PID table; the standard
        // init is rebuilt from the last entry carrying a receive filter
        let mut std_rxheader: Option<String> = None;
        for raw in self.std_pids {
            let Some((_, signal)) = get_pid_for_name(&raw.name) else {
                warn!("No PID info found for {}", raw.name);
                continue;
            };
            let Some(cmd) = command_for_name(&raw.name) else {
                continue;
            };
            if !names.insert(raw.name.clone()) {
                bail!("Duplicate parameter name: {}", raw.name);
            }
            if raw.rxheader.is_some() {
                std_rxheader = non_empty(raw.rxheader.clone());
            }
            let parameter = Parameter {
                name: raw.name,
                sensor_type: raw.sensor_type.unwrap_or_default(),
                unit: Some(signal.unit.to_string()),
                class: Some(signal.class.to_string()),
                period: Duration::from_millis(
                    raw.period
                        .as_ref()
                        .and_then(MsValue::ms)
                        .unwrap_or(default_cycle_ms),
                ),
                min: None,
                max: None,
                expression: None,
                destination: non_empty(raw.destination),
                destination_kind: raw
                    .destination_type
                    .as_deref()
                    .map(DestinationKind::from_config_str)
                    .unwrap_or_default(),
                std_signal: Some(signal),
                last_value: None,
                failed: false,
                next_due_at: None,
            };
            entries.push(PidEntry {
                kind: PidKind::Standard,
                cmd,
                init: CommandList::default(),
                rxheader: non_empty(raw.rxheader),
                parameters: vec![parameter],
            });
        }

        let standard_init = match standard_protocol {
            StandardProtocol::Fixed(p) => standard_init_commands(p, std_rxheader.as_deref()),
            // Filled in by the scheduler once ATDPN reports the number
            StandardProtocol::Auto => CommandList::single("ATTP0"),
        };

        let mut destinations: Vec<Destination> = self
            .destinations
            .into_iter()
            .map(|d| d.resolve(default_cycle_ms))
            .collect();

        // Legacy single-destination config folds into the same vector
        if destinations.is_empty() {
            if let Some(target) = non_empty(self.destination) {
                destinations.push(
                    RawDestination {
                        kind: self.group_dest_type,
                        destination: Some(target),
                        cycle: Some(MsValue::Number(default_cycle_ms)),
                        api_token: self.group_api_token,
                        cert_set: None,
                        enabled: Some(true),
                        auth: None,
                        query_params: Vec::new(),
                    }
                    .resolve(default_cycle_ms),
                );
            }
        }

        Ok(AllPids {
            entries,
            destinations,
            grouping_enabled: enabled_flag(self.grouping.as_ref(), false),
            custom_init,
            standard_init,
            specific_init,
            standard_protocol,
            standard_enabled: enabled_flag(self.standard_pids.as_ref(), false),
            custom_enabled: enabled_flag(self.custom_pids.as_ref(), true),
            specific_enabled: enabled_flag(self.car_specific.as_ref(), false),
            car_model: non_empty(self.car_model),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_list_parse() {
        let list = CommandList::parse("ATSH7E0;ATCRA7E8");
        let commands: Vec<&str> = list.iter().collect();
        assert_eq!(commands, ["ATSH7E0\r", "ATCRA7E8\r"]);
    }

    #[test]
    fn test_command_list_atsp_rewrite() {
        let list = CommandList::parse_with_attp_rewrite("ATSP6;ATH1");
        let commands: Vec<&str> = list.iter().collect();
        assert_eq!(commands, ["ATTP6\r", "ATH1\r"]);

        // Plain parse leaves vehicle-profile strings untouched
        let list = CommandList::parse("ATSP6");
        assert_eq!(list.iter().collect::<Vec<_>>(), ["ATSP6\r"]);
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(
            normalize_url(DestinationKind::Http, "example.com/data"),
            "http://example.com/data"
        );
        assert_eq!(
            normalize_url(DestinationKind::Https, "example.com"),
            "https://example.com"
        );
        assert_eq!(
            normalize_url(DestinationKind::Abrp, "api.iternio.com/1/tlm"),
            "https://api.iternio.com/1/tlm"
        );
        assert_eq!(
            normalize_url(DestinationKind::Http, "https://already.example"),
            "https://already.example"
        );
        assert_eq!(
            normalize_url(DestinationKind::MqttTopic, "car/telemetry"),
            "car/telemetry"
        );
    }

    #[test]
    fn test_standard_protocol_parse() {
        assert_eq!(StandardProtocol::parse("auto"), StandardProtocol::Auto);
        assert_eq!(StandardProtocol::parse("0"), StandardProtocol::Auto);
        assert_eq!(StandardProtocol::parse("6"), StandardProtocol::Fixed(6));
        assert_eq!(StandardProtocol::parse("A"), StandardProtocol::Fixed(10));
        assert_eq!(StandardProtocol::parse("zz"), StandardProtocol::Auto);
    }

    #[test]
    fn test_standard_init_for_protocols() {
        let init = standard_init_commands(6, None);
        assert_eq!(
            init.iter().collect::<Vec<_>>(),
            ["ATTP6\r", "ATSH7DF\r", "ATCRA\r"]
        );

        let init = standard_init_commands(7, Some("18DAF110"));
        assert_eq!(
            init.iter().collect::<Vec<_>>(),
            ["ATTP7\r", "ATSH18DB33F1\r", "ATCRA18DAF110\r"]
        );

        let init = standard_init_commands(3, None);
        assert_eq!(init.iter().collect::<Vec<_>>(), ["ATTP0\r"]);
    }

    #[test]
    fn test_from_json_standard_entry() {
        let json = r#"{
            "standard_pids": "enable",
            "ecu_protocol": "6",
            "grouping": "enable",
            "std_pids": [{"name": "0C-EngineRPM", "period": 1000}]
        }"#;
        let pids = AllPids::from_json(json).unwrap();
        assert!(pids.standard_enabled);
        assert!(pids.grouping_enabled);
        assert_eq!(pids.entries.len(), 1);
        let entry = &pids.entries[0];
        assert_eq!(entry.kind, PidKind::Standard);
        assert_eq!(entry.cmd, "010C\r");
        let param = &entry.parameters[0];
        assert_eq!(param.name, "0C-EngineRPM");
        assert_eq!(param.unit.as_deref(), Some("rpm"));
        assert!(param.std_signal.is_some());
        assert_eq!(param.period, Duration::from_millis(1000));
        assert_eq!(
            pids.standard_init.iter().collect::<Vec<_>>(),
            ["ATTP6\r", "ATSH7DF\r", "ATCRA\r"]
        );
    }

    #[test]
    fn test_from_json_custom_entry_and_window() {
        let json = r#"{
            "custom_pids": "enable",
            "initialisation": "ATSP6;ATH1",
            "pids": [{
                "pid": "220101",
                "pid_init": "ATSH7E4",
                "rxheader": "7EC",
                "parameters": [{
                    "name": "SOC",
                    "expression": "B4/2",
                    "unit": "%",
                    "period": 3000,
                    "min": 0,
                    "max": 100
                }]
            }]
        }"#;
        let pids = AllPids::from_json(json).unwrap();
        let entry = &pids.entries[0];
        assert_eq!(entry.kind, PidKind::Custom);
        assert_eq!(entry.cmd, "220101\r");
        assert_eq!(entry.init.iter().collect::<Vec<_>>(), ["ATSH7E4\r"]);
        let param = &entry.parameters[0];
        assert_eq!(param.min, Some(0.0));
        assert_eq!(param.max, Some(100.0));
        assert_eq!(param.expression.as_deref(), Some("B4/2"));
        assert_eq!(
            pids.custom_init.iter().collect::<Vec<_>>(),
            ["ATTP6\r", "ATH1\r"]
        );
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let json = r#"{
            "pids": [{
                "pid": "220101",
                "parameters": [
                    {"name": "SOC", "expression": "B4"},
                    {"name": "SOC", "expression": "B5"}
                ]
            }]
        }"#;
        assert!(AllPids::from_json(json).is_err());
    }

    #[test]
    fn test_destination_auth_resolution() {
        let json = r#"{
            "destinations": [
                {"type": "HTTPS", "destination": "example.com/a", "cycle": 5000,
                 "auth": {"type": "basic", "basic_username": "u", "basic_password": "p"}},
                {"type": "HTTP", "destination": "example.com/b", "api_token": "tok"},
                {"type": "ABRP_API", "destination": "api.iternio.com/1/tlm",
                 "api_token": "abrp-token", "cert_set": "mine"}
            ]
        }"#;
        let pids = AllPids::from_json(json).unwrap();
        assert_eq!(pids.destinations.len(), 3);

        let basic = &pids.destinations[0];
        assert_eq!(basic.target, "https://example.com/a");
        assert_eq!(basic.cycle_ms, 5000);
        assert!(matches!(basic.auth, DestinationAuth::Basic { .. }));

        // Legacy api_token becomes a bearer token on HTTP(S)
        let legacy = &pids.destinations[1];
        assert_eq!(
            legacy.auth,
            DestinationAuth::Bearer {
                token: "tok".to_string()
            }
        );

        // ABRP keeps the token in the body and forces the default bundle
        let abrp = &pids.destinations[2];
        assert_eq!(abrp.auth, DestinationAuth::None);
        assert_eq!(abrp.cert_set, "default");
        assert_eq!(abrp.api_token.as_deref(), Some("abrp-token"));
    }

    #[test]
    fn test_legacy_single_destination() {
        let json = r#"{
            "destination": "garage/telemetry",
            "group_dest_type": "MQTT_Topic",
            "cycle": 2000
        }"#;
        let pids = AllPids::from_json(json).unwrap();
        assert_eq!(pids.destinations.len(), 1);
        let dest = &pids.destinations[0];
        assert_eq!(dest.kind, DestinationKind::MqttTopic);
        assert_eq!(dest.target, "garage/telemetry");
        assert_eq!(dest.cycle_ms, 2000);
    }

    #[test]
    fn test_unknown_std_pid_skipped() {
        let json = r#"{"std_pids": [{"name": "FE-Bogus"}]}"#;
        let pids = AllPids::from_json(json).unwrap();
        assert!(pids.entries.is_empty());
    }
}
