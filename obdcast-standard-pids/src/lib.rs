//! Standard OBD-II mode 01 PID definitions and signal extraction.
//!
//! Parameters are addressed by `"<PID>-<Name>"` strings such as
//! `"0C-EngineRPM"`; the hex PID selects the table entry and the suffix
//! selects one signal within it (a single PID can carry several, e.g.
//! oxygen sensor voltage and short-term fuel trim).
//!
//! Bit positions follow the Motorola (big-endian) convention used by DBC
//! files: `bit_start = 31` addresses the first data byte of a response
//! buffer whose data begins at index 3.

use derive_more::{Display, Error};

/// One decodable signal within a standard PID.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StdParameter {
    pub name: &'static str,
    pub class: &'static str,
    pub unit: &'static str,
    pub bit_start: u8,
    pub bit_length: u8,
    pub scale: f32,
    pub offset: f32,
    pub min: f32,
    pub max: f32,
}

/// A standard PID and the signals it carries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StdPid {
    pub pid: u8,
    pub base_name: &'static str,
    pub params: &'static [StdParameter],
}

#[derive(Debug, Display, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[display("data too short: need {needed} bytes from offset {start}, have {len}")]
    ShortData {
        start: usize,
        needed: usize,
        len: usize,
    },
}

macro_rules! param {
    ($name:literal, $class:literal, $unit:literal, $bit_start:expr, $bit_length:expr,
     $scale:expr, $offset:expr, $min:expr, $max:expr) => {
        StdParameter {
            name: $name,
            class: $class,
            unit: $unit,
            bit_start: $bit_start,
            bit_length: $bit_length,
            scale: $scale,
            offset: $offset,
            min: $min,
            max: $max,
        }
    };
}

/// Mode 01 PIDs, sorted by PID number.
pub static STANDARD_PIDS: &[StdPid] = &[
    StdPid {
        pid: 0x00,
        base_name: "PIDsSupported_01_20",
        params: &[param!("PIDsSupported_01_20", "enum", "Encoded", 31, 32, 1.0, 0.0, 0.0, 0.0)],
    },
    StdPid {
        pid: 0x01,
        base_name: "MonitorStatus",
        params: &[param!("MonitorStatus", "enum", "Encoded", 31, 32, 1.0, 0.0, 0.0, 0.0)],
    },
    StdPid {
        pid: 0x04,
        base_name: "CalcEngineLoad",
        params: &[param!("CalcEngineLoad", "None", "%", 31, 8, 0.392_156_86, 0.0, 0.0, 100.0)],
    },
    StdPid {
        pid: 0x05,
        base_name: "EngineCoolantTemp",
        params: &[param!("EngineCoolantTemp", "temperature", "degC", 31, 8, 1.0, -40.0, -40.0, 215.0)],
    },
    StdPid {
        pid: 0x06,
        base_name: "ShortFuelTrimBank1",
        params: &[param!("ShortFuelTrimBank1", "None", "%", 31, 8, 0.781_25, -100.0, -100.0, 99.0)],
    },
    StdPid {
        pid: 0x07,
        base_name: "LongFuelTrimBank1",
        params: &[param!("LongFuelTrimBank1", "None", "%", 31, 8, 0.781_25, -100.0, -100.0, 99.0)],
    },
    StdPid {
        pid: 0x0A,
        base_name: "FuelPressure",
        params: &[param!("FuelPressure", "pressure", "kPa", 31, 8, 3.0, 0.0, 0.0, 765.0)],
    },
    StdPid {
        pid: 0x0B,
        base_name: "IntakeManifoldAbsPressure",
        params: &[param!("IntakeManifoldAbsPressure", "pressure", "kPa", 31, 8, 1.0, 0.0, 0.0, 255.0)],
    },
    StdPid {
        pid: 0x0C,
        base_name: "EngineRPM",
        params: &[param!("EngineRPM", "speed", "rpm", 31, 16, 0.25, 0.0, 0.0, 16384.0)],
    },
    StdPid {
        pid: 0x0D,
        base_name: "VehicleSpeed",
        params: &[param!("VehicleSpeed", "speed", "km/h", 31, 8, 1.0, 0.0, 0.0, 255.0)],
    },
    StdPid {
        pid: 0x0E,
        base_name: "TimingAdvance",
        params: &[param!("TimingAdvance", "None", "deg", 31, 8, 0.5, -64.0, -64.0, 64.0)],
    },
    StdPid {
        pid: 0x0F,
        base_name: "IntakeAirTemperature",
        params: &[param!("IntakeAirTemperature", "temperature", "degC", 31, 8, 1.0, -40.0, -40.0, 215.0)],
    },
    StdPid {
        pid: 0x10,
        base_name: "MAFAirFlowRate",
        params: &[param!("MAFAirFlowRate", "volume_flow_rate", "grams/sec", 31, 16, 0.01, 0.0, 0.0, 655.0)],
    },
    StdPid {
        pid: 0x11,
        base_name: "ThrottlePosition",
        params: &[param!("ThrottlePosition", "None", "%", 31, 8, 0.392_156_86, 0.0, 0.0, 100.0)],
    },
    StdPid {
        pid: 0x14,
        base_name: "OxySensor1",
        params: &[
            param!("OxySensor1_Volt", "voltage", "volts", 31, 8, 0.005, 0.0, 0.0, 1.0),
            param!("OxySensor1_STFT", "None", "%", 39, 8, 0.781_25, -100.0, -100.0, 99.0),
        ],
    },
    StdPid {
        pid: 0x1F,
        base_name: "RunTimeSinceStart",
        params: &[param!("RunTimeSinceStart", "duration", "sec", 31, 16, 1.0, 0.0, 0.0, 65535.0)],
    },
    StdPid {
        pid: 0x20,
        base_name: "PIDsSupported_21_40",
        params: &[param!("PIDsSupported_21_40", "enum", "Encoded", 31, 32, 1.0, 0.0, 0.0, 0.0)],
    },
    StdPid {
        pid: 0x21,
        base_name: "DistanceMILOn",
        params: &[param!("DistanceMILOn", "distance", "km", 31, 16, 1.0, 0.0, 0.0, 65535.0)],
    },
    StdPid {
        pid: 0x2F,
        base_name: "FuelTankLevel",
        params: &[param!("FuelTankLevel", "None", "%", 31, 8, 0.392_156_86, 0.0, 0.0, 100.0)],
    },
    StdPid {
        pid: 0x31,
        base_name: "DistanceSinceCodeClear",
        params: &[param!("DistanceSinceCodeClear", "distance", "km", 31, 16, 1.0, 0.0, 0.0, 65535.0)],
    },
    StdPid {
        pid: 0x33,
        base_name: "AbsBaroPressure",
        params: &[param!("AbsBaroPressure", "pressure", "kPa", 31, 8, 1.0, 0.0, 0.0, 255.0)],
    },
    StdPid {
        pid: 0x40,
        base_name: "PIDsSupported_41_60",
        params: &[param!("PIDsSupported_41_60", "enum", "Encoded", 31, 32, 1.0, 0.0, 0.0, 0.0)],
    },
    StdPid {
        pid: 0x42,
        base_name: "ControlModuleVolt",
        params: &[param!("ControlModuleVolt", "voltage", "V", 31, 16, 0.001, 0.0, 0.0, 66.0)],
    },
    StdPid {
        pid: 0x46,
        base_name: "AmbientAirTemp",
        params: &[param!("AmbientAirTemp", "temperature", "degC", 31, 8, 1.0, -40.0, -40.0, 215.0)],
    },
    StdPid {
        pid: 0x5C,
        base_name: "EngineOilTemp",
        params: &[param!("EngineOilTemp", "temperature", "degC", 31, 8, 1.0, -40.0, -40.0, 215.0)],
    },
    StdPid {
        pid: 0x5E,
        base_name: "EngineFuelRate",
        params: &[param!("EngineFuelRate", "gas", "L/h", 31, 16, 0.05, 0.0, 0.0, 3277.0)],
    },
];

/// Look up a PID entry by number.
pub fn get_pid(pid: u8) -> Option<&'static StdPid> {
    STANDARD_PIDS
        .binary_search_by_key(&pid, |p| p.pid)
        .ok()
        .map(|idx| &STANDARD_PIDS[idx])
}

/// Split a `"0C-EngineRPM"` style name into the PID number and signal suffix.
pub fn split_name(name: &str) -> Option<(u8, Option<&str>)> {
    let pid = u8::from_str_radix(name.get(0..2)?, 16).ok()?;
    let suffix = name.splitn(2, '-').nth(1);
    Some((pid, suffix))
}

/// Resolve a `"<PID>-<Name>"` parameter name to its table entry and signal.
///
/// A name without a suffix resolves only when the PID carries exactly one
/// signal.
pub fn get_pid_for_name(name: &str) -> Option<(&'static StdPid, &'static StdParameter)> {
    let (pid_num, suffix) = split_name(name)?;
    let pid = get_pid(pid_num)?;
    match suffix {
        Some(wanted) => pid
            .params
            .iter()
            .find(|p| p.name == wanted)
            .map(|p| (pid, p)),
        None if pid.params.len() == 1 => Some((pid, &pid.params[0])),
        None => None,
    }
}

/// Build the mode 01 request for a `"<PID>-<Name>"` parameter.
pub fn command_for_name(name: &str) -> Option<String> {
    let (pid, _) = split_name(name)?;
    Some(format!("01{pid:02X}\r"))
}

/// Extract a physical value from a response buffer.
///
/// Loads `bit_length` bits big-endian starting at `bit_start / 8`, masks,
/// then applies scale/offset and clamps to the signal's min/max.
pub fn extract_signal_value(data: &[u8], param: &StdParameter) -> Result<f32, DecodeError> {
    let start_byte = usize::from(param.bit_start / 8);
    let bytes_needed = usize::from(param.bit_length).div_ceil(8);

    if start_byte + bytes_needed > data.len() {
        return Err(DecodeError::ShortData {
            start: start_byte,
            needed: bytes_needed,
            len: data.len(),
        });
    }

    let mut raw: u32 = 0;
    for &byte in &data[start_byte..start_byte + bytes_needed] {
        raw = (raw << 8) | u32::from(byte);
    }

    let mask = (1u64 << param.bit_length) - 1;
    raw = (u64::from(raw) & mask) as u32;

    let physical = raw as f32 * param.scale + param.offset;
    Ok(physical.clamp(param.min, param.max))
}
