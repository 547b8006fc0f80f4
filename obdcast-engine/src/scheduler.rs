//! PID scheduler: the single polling loop that owns the adapter.
//!
//! Parameters run strictly in declaration order. Crossing from one PID
//! class to another re-sends that class's init sequence; each parameter's
//! deadline is set before its command is issued so a slow ECU reply never
//! causes catch-up bursts. The config mutex is held across one whole
//! transaction (command, reply, decode, store) and released between
//! parameters.

use crate::adapter::{send_command, AdapterError, AdapterSender};
use crate::cell::ProtocolCell;
use crate::config::{
    AllPids, CommandList, DestinationKind, Parameter, PidKind, SensorType, StandardProtocol,
};
use crate::io::{Evaluator, MqttClient};
use crate::response::{merge_bitmap, parse_frames};
use crate::status::DeviceStatus;
use crate::store::{precision_number, ParameterStore};
use anyhow::Result;
use log::{debug, error, info, warn};
use obdcast_elm327_lib::{is_forbidden_hot_command, is_negative_reply, parse_dpn_reply};
use obdcast_standard_pids::{extract_signal_value, get_pid, split_name};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How long to wait for an ECU reply before marking the parameter failed.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(12);
/// Adapter configuration applied at startup and whenever polling resumes.
pub const DEFAULT_ADAPTER_INIT: &str = "ati\rate0\rath1\ratl0\rats1\ratm0\ratst96\r";

const DEFAULT_INIT_DELAY: Duration = Duration::from_millis(50);
const CLASS_INIT_DELAY: Duration = Duration::from_millis(2);
const INIT_REPLY_TIMEOUT: Duration = Duration::from_secs(1);
/// Pause between parameter transactions (mutex released).
const PARAMETER_GAP: Duration = Duration::from_millis(105);
/// Pause between passes.
const PASS_GAP: Duration = Duration::from_millis(100);
const ECU_CHECK_PERIOD: Duration = Duration::from_secs(2);

pub struct SchedulerDeps {
    pub adapter: AdapterSender,
    pub store: Arc<ParameterStore>,
    pub status: Arc<DeviceStatus>,
    pub cell: Arc<ProtocolCell>,
    pub mqtt: Arc<dyn MqttClient>,
    pub evaluator: Arc<dyn Evaluator>,
    /// Topic for per-parameter publications without an explicit one.
    pub default_mqtt_topic: Option<String>,
}

pub struct Scheduler {
    deps: SchedulerDeps,
    /// Class of the previously polled entry; persists across passes so an
    /// init is only re-sent on an actual transition.
    previous_kind: Option<PidKind>,
    ecu_check_at: Instant,
}

/// Start the scheduler on its own thread.
pub fn start_scheduler_task(deps: SchedulerDeps) -> JoinHandle<()> {
    crate::thread_util::spawn_named("obd_scheduler", move || {
        Scheduler::new(deps).run();
    })
}

impl Scheduler {
    pub fn new(deps: SchedulerDeps) -> Self {
        Self {
            deps,
            previous_kind: None,
            ecu_check_at: Instant::now() + ECU_CHECK_PERIOD,
        }
    }

    /// Run until shutdown is requested.
    pub fn run(mut self) {
        info!("Scheduler task started");
        std::thread::sleep(Duration::from_millis(100));

        let default_init = CommandList::parse(DEFAULT_ADAPTER_INIT);
        send_commands(&self.deps.adapter, &default_init, DEFAULT_INIT_DELAY);
        self.detect_protocol();

        info!("Total PID entries: {}", self.deps.store.pids().entries.len());
        self.ecu_check_at = Instant::now() + ECU_CHECK_PERIOD;

        loop {
            if self.deps.status.shutdown_requested() {
                break;
            }
            if self.deps.status.is_sleeping() {
                info!("Device is sleeping, waiting for wakeup");
                if !self.deps.status.wait_until_awake() {
                    break;
                }
                info!("Device awake, resuming polling");
            }
            if !self.deps.status.is_enabled() {
                info!("Polling is disabled, waiting for enable");
                if !self.deps.status.wait_until_enabled() {
                    break;
                }
                info!("Polling enabled, resuming");
                send_commands(&self.deps.adapter, &default_init, DEFAULT_INIT_DELAY);
                std::thread::sleep(Duration::from_millis(100));
            }

            self.run_pass();
            std::thread::sleep(PASS_GAP);

            if Instant::now() >= self.ecu_check_at {
                let connected = !self.deps.store.all_failed();
                self.deps.status.set_ecu_connected(connected);
                if !connected {
                    warn!("All parameters failed - ECU disconnected");
                }
                self.ecu_check_at = Instant::now() + ECU_CHECK_PERIOD;
            }
        }
        info!("Scheduler task stopped");
    }

    /// Resolve the protocol number into the cell; auto protocols query the
    /// adapter and pin the reported number into the standard init.
    fn detect_protocol(&mut self) {
        let configured = self.deps.store.pids().standard_protocol;
        match configured {
            StandardProtocol::Fixed(p) => self.deps.cell.set(i32::from(p)),
            StandardProtocol::Auto => {
                info!("Protocol is auto, querying adapter");
                match send_command(&self.deps.adapter, b"ATDPN\r", Duration::from_secs(2)) {
                    Ok(reply) => {
                        let text = String::from_utf8_lossy(&reply);
                        if let Some(number) = parse_dpn_reply(&text) {
                            self.deps.cell.set(i32::from(number));
                            self.deps.store.pids().rebuild_standard_init(number);
                            info!("Protocol number: {number}");
                        } else {
                            error!("Failed to parse protocol number from {text:?}");
                        }
                    }
                    Err(e) => error!("Failed to get protocol number: {e}"),
                }
            }
        }
    }

    /// One pass over every entry and parameter in declaration order.
    fn run_pass(&mut self) {
        let mut guard = self.deps.store.pids();
        let entry_count = guard.entries.len();

        for entry_index in 0..entry_count {
            let (kind, cmd, entry_init, enabled) = {
                let entry = &guard.entries[entry_index];
                (
                    entry.kind,
                    entry.cmd.clone(),
                    entry.init.clone(),
                    guard.kind_enabled(entry.kind),
                )
            };
            if !enabled {
                continue;
            }

            let param_count = guard.entries[entry_index].parameters.len();
            for param_index in 0..param_count {
                let now = Instant::now();
                if !guard.entries[entry_index].parameters[param_index].is_due(now) {
                    continue;
                }

                // Class transition init goes out before the deadline is
                // updated
                if self.previous_kind != Some(kind) {
                    let class_init = match kind {
                        PidKind::Custom => guard.custom_init.clone(),
                        PidKind::Standard => guard.standard_init.clone(),
                        PidKind::Specific => guard.specific_init.clone(),
                    };
                    if !class_init.is_empty() {
                        info!("Sending {kind:?} class init");
                        send_commands(&self.deps.adapter, &class_init, CLASS_INIT_DELAY);
                    }
                    self.previous_kind = Some(kind);
                }

                debug!(
                    "Processing parameter: {}",
                    guard.entries[entry_index].parameters[param_index].name
                );
                guard.entries[entry_index].parameters[param_index].schedule_next(now);

                if kind != PidKind::Standard && !entry_init.is_empty() {
                    send_commands(&self.deps.adapter, &entry_init, CLASS_INIT_DELAY);
                }

                debug!("Executing command: {}", cmd.trim_end());
                let reply = send_command(&self.deps.adapter, cmd.as_bytes(), REPLY_TIMEOUT);
                self.handle_reply(&mut guard, entry_index, param_index, kind, reply);

                self.deps.store.update_snapshot(&guard);
                drop(guard);
                std::thread::sleep(PARAMETER_GAP);
                if self.deps.status.shutdown_requested() {
                    return;
                }
                guard = self.deps.store.pids();
            }
        }
    }

    fn handle_reply(
        &self,
        pids: &mut AllPids,
        entry_index: usize,
        param_index: usize,
        kind: PidKind,
        reply: Result<Vec<u8>, AdapterError>,
    ) {
        let param = &mut pids.entries[entry_index].parameters[param_index];
        let raw = match reply {
            Ok(raw) => raw,
            Err(e) => {
                error!("Command failed for {}: {e}", param.name);
                param.failed = true;
                return;
            }
        };

        let text = String::from_utf8_lossy(&raw).into_owned();
        if is_negative_reply(&text) {
            error!("Negative reply for {}: {}", param.name, text.trim());
            param.failed = true;
            return;
        }

        param.failed = false;
        self.deps.status.set_ecu_connected(true);
        let response = parse_frames(&text, self.deps.cell.peek());

        match kind {
            PidKind::Standard => {
                let Some(signal) = param.std_signal else {
                    return;
                };
                let Some((pid_number, _)) = split_name(&param.name) else {
                    return;
                };
                // Multi-ECU replies decode from the primary responder
                let Some(buffer) = normalize_standard_buffer(response.decode_source(), pid_number)
                else {
                    warn!("No 41 {pid_number:02X} payload in reply for {}", param.name);
                    return;
                };
                match extract_signal_value(&buffer, signal) {
                    Ok(value) => {
                        let value = round2(f64::from(value));
                        info!("Parameter {} result: {value} {}", param.name, signal.unit);
                        param.last_value = Some(value);
                        publish_parameter_mqtt(
                            self.deps.mqtt.as_ref(),
                            self.deps.default_mqtt_topic.as_deref(),
                            param,
                        );
                    }
                    // Short data is transient, the parameter keeps its value
                    Err(e) => warn!("Failed to extract signal for {}: {e}", param.name),
                }
            }
            PidKind::Custom | PidKind::Specific => {
                let Some(expression) = param.expression.clone() else {
                    return;
                };
                match self.deps.evaluator.evaluate(&expression, &response.bytes, 0) {
                    Some(value) => {
                        if let Some(min) = param.min {
                            if value < f64::from(min) {
                                warn!(
                                    "Parameter {} value {value:.2} below min {min:.2} - ignoring",
                                    param.name
                                );
                                return;
                            }
                        }
                        if let Some(max) = param.max {
                            if value > f64::from(max) {
                                warn!(
                                    "Parameter {} value {value:.2} above max {max:.2} - ignoring",
                                    param.name
                                );
                                return;
                            }
                        }
                        let value = round2(value);
                        info!("Parameter {} result: {value}", param.name);
                        param.last_value = Some(value);
                        publish_parameter_mqtt(
                            self.deps.mqtt.as_ref(),
                            self.deps.default_mqtt_topic.as_deref(),
                            param,
                        );
                    }
                    None => warn!("Expression failed for {}", param.name),
                }
            }
        }
    }
}

/// Send a command list, dropping anything that would break the polling
/// parser's framing (ATH0/ATS0/ATE1). Replies are awaited but ignored.
fn send_commands(adapter: &AdapterSender, commands: &CommandList, delay: Duration) {
    for cmd in commands.iter() {
        if is_forbidden_hot_command(cmd) {
            warn!("Dropping forbidden polling command: {}", cmd.trim_end());
            continue;
        }
        if let Err(e) = send_command(adapter, cmd.as_bytes(), INIT_REPLY_TIMEOUT) {
            debug!("Init command {:?} failed: {e}", cmd.trim_end());
        }
        std::thread::sleep(delay);
    }
}

/// Round to two decimals, half away from zero.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Align a standard reply so the `41 <pid>` positive-response marker sits
/// at index 1 and the first data byte at index 3, where the table's
/// `bit_start = 31` expects it.
pub fn normalize_standard_buffer(bytes: &[u8], pid: u8) -> Option<Vec<u8>> {
    let at = bytes
        .windows(2)
        .position(|pair| pair[0] == 0x41 && pair[1] == pid)?;
    let mut buffer = Vec::with_capacity(bytes.len() - at + 1);
    buffer.push(0x00);
    buffer.extend_from_slice(&bytes[at..]);
    Some(buffer)
}

/// Publish one parameter to its own MQTT destination: JSON for topics,
/// the bare value for wallboxes, nothing otherwise.
fn publish_parameter_mqtt(mqtt: &dyn MqttClient, default_topic: Option<&str>, param: &Parameter) {
    let payload = match param.destination_kind {
        DestinationKind::MqttTopic => {
            let Some(value) = param.last_value else {
                return;
            };
            let rendered = match param.sensor_type {
                SensorType::Binary => {
                    Value::String(if value > 0.0 { "on" } else { "off" }.to_string())
                }
                SensorType::Numeric => Value::Number(precision_number(value)),
            };
            let mut root = Map::new();
            root.insert(param.name.clone(), rendered);
            Value::Object(root).to_string()
        }
        DestinationKind::MqttWallbox => format!("{:.2}", param.last_value.unwrap_or(0.0)),
        _ => return,
    };

    let Some(topic) = param.destination.as_deref().or(default_topic) else {
        return;
    };
    if let Err(e) = mqtt.publish(topic, &payload, 0, true, false) {
        error!("MQTT publish to {topic} failed: {e}");
    } else {
        info!("Published to {topic}");
    }
}

/// Probe which standard PIDs the vehicle supports by walking the support
/// bitmaps (`0100`, `0120`, ... `01A0`) and return them as
/// `{"std_pids": ["0C-EngineRPM", ...]}`.
pub fn find_supported_standard_pids(
    adapter: &AdapterSender,
    cell: &ProtocolCell,
    protocol: u8,
) -> Result<String> {
    const SUPPORT_COMMANDS: [&str; 6] = ["0100\r", "0120\r", "0140\r", "0160\r", "0180\r", "01A0\r"];

    send_commands(
        adapter,
        &CommandList::parse("atws\ratm0\rate0\rath1\ratl0\rats1\ratst96\r"),
        DEFAULT_INIT_DELAY,
    );

    let preamble = match crate::config::sh_for_protocol(protocol) {
        Some(sh) => CommandList::from_commands(vec![
            format!("ATTP{protocol:X}"),
            format!("ATSH{sh}"),
            "ATCRA".to_string(),
        ]),
        None => CommandList::parse("ATTP0\rATCRA"),
    };
    info!("Probing standard PID support on protocol {protocol}");
    send_commands(adapter, &preamble, DEFAULT_INIT_DELAY);

    let mut names: Vec<Value> = Vec::new();
    for (block, cmd) in SUPPORT_COMMANDS.iter().enumerate() {
        let reply = match send_command(adapter, cmd.as_bytes(), Duration::from_secs(10)) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Support command {} failed: {e}", cmd.trim_end());
                continue;
            }
        };
        let text = String::from_utf8_lossy(&reply);
        if is_negative_reply(&text) {
            warn!("Support command {} rejected: {}", cmd.trim_end(), text.trim());
            continue;
        }
        let response = parse_frames(&text, cell.peek());
        if response.bytes.len() < 7 {
            warn!("Support reply too short: {} bytes", response.bytes.len());
            continue;
        }
        let merged = merge_bitmap(&response.bytes);
        let bitmap = u32::from_be_bytes([merged[3], merged[4], merged[5], merged[6]]);
        debug!("Support bitmap for block {block}: {bitmap:#010X}");

        for bit in 0..32u8 {
            if bitmap & (1 << (31 - u32::from(bit))) != 0 {
                #[allow(clippy::cast_possible_truncation)]
                let pid = (block as u8) * 32 + bit + 1;
                if let Some(info) = get_pid(pid) {
                    for signal in info.params {
                        names.push(Value::String(format!("{pid:02X}-{}", signal.name)));
                    }
                }
            }
        }
    }

    let mut root = Map::new();
    root.insert("std_pids".to_string(), Value::Array(names));
    Ok(Value::Object(root).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::sync::Mutex;

    #[test]
    fn test_normalize_standard_buffer() {
        // S1: engine RPM reply on protocol 6
        let bytes = [0x04, 0x41, 0x0C, 0x1A, 0xF8];
        let buffer = normalize_standard_buffer(&bytes, 0x0C).unwrap();
        assert_eq!(buffer, [0x00, 0x41, 0x0C, 0x1A, 0xF8]);

        // Marker not at the front
        let bytes = [0xAA, 0xBB, 0x41, 0x05, 0x4F];
        let buffer = normalize_standard_buffer(&bytes, 0x05).unwrap();
        assert_eq!(buffer, [0x00, 0x41, 0x05, 0x4F]);

        // Wrong PID: nothing to decode
        assert!(normalize_standard_buffer(&bytes, 0x0C).is_none());
        assert!(normalize_standard_buffer(&[], 0x0C).is_none());
    }

    #[test]
    fn test_normalized_rpm_decodes_to_1726() {
        let bytes = [0x04, 0x41, 0x0C, 0x1A, 0xF8];
        let buffer = normalize_standard_buffer(&bytes, 0x0C).unwrap();
        let (_, signal) = obdcast_standard_pids::get_pid_for_name("0C-EngineRPM").unwrap();
        let value = extract_signal_value(&buffer, signal).unwrap();
        assert!((f64::from(value) - 1726.0).abs() < 1e-6);
    }

    #[test]
    fn test_round2_half_away_from_zero() {
        assert!((round2(1726.004) - 1726.0).abs() < 1e-9);
        assert!((round2(0.005) - 0.01).abs() < 1e-9);
        assert!((round2(-0.005) + 0.01).abs() < 1e-9);
    }

    #[derive(Default)]
    struct RecordingMqtt {
        published: Mutex<Vec<(String, String)>>,
    }

    impl MqttClient for RecordingMqtt {
        fn publish(
            &self,
            topic: &str,
            payload: &str,
            _qos: u8,
            _retain: bool,
            _dup: bool,
        ) -> Result<()> {
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), payload.to_string()));
            Ok(())
        }
    }

    fn parameter(kind: DestinationKind, sensor: SensorType, value: f64) -> Parameter {
        Parameter {
            name: "SOC".to_string(),
            sensor_type: sensor,
            unit: None,
            class: None,
            period: Duration::from_millis(0),
            min: None,
            max: None,
            expression: None,
            destination: Some("car/soc".to_string()),
            destination_kind: kind,
            std_signal: None,
            last_value: Some(value),
            failed: false,
            next_due_at: None,
        }
    }

    #[test]
    fn test_publish_parameter_topic_json() {
        let mqtt = RecordingMqtt::default();
        let param = parameter(DestinationKind::MqttTopic, SensorType::Numeric, 62.3);
        publish_parameter_mqtt(&mqtt, None, &param);
        let published = mqtt.published.lock().unwrap();
        assert_eq!(published[0], ("car/soc".to_string(), r#"{"SOC":62.3}"#.to_string()));
    }

    #[test]
    fn test_publish_parameter_binary_renders_on() {
        let mqtt = RecordingMqtt::default();
        let param = parameter(DestinationKind::MqttTopic, SensorType::Binary, 1.0);
        publish_parameter_mqtt(&mqtt, None, &param);
        let published = mqtt.published.lock().unwrap();
        assert_eq!(published[0].1, r#"{"SOC":"on"}"#);
    }

    #[test]
    fn test_publish_parameter_wallbox_plain_value() {
        let mqtt = RecordingMqtt::default();
        let param = parameter(DestinationKind::MqttWallbox, SensorType::Numeric, 62.3);
        publish_parameter_mqtt(&mqtt, None, &param);
        let published = mqtt.published.lock().unwrap();
        assert_eq!(published[0].1, "62.30");
    }

    #[test]
    fn test_publish_parameter_default_kind_publishes_nothing() {
        let mqtt = RecordingMqtt::default();
        let param = parameter(DestinationKind::Default, SensorType::Numeric, 62.3);
        publish_parameter_mqtt(&mqtt, None, &param);
        assert!(mqtt.published.lock().unwrap().is_empty());
    }
}
