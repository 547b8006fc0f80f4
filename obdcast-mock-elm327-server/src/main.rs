//! Mock ELM327 OBD2 adapter for testing the obdcast engine
//!
//! Usage: cargo run -p obdcast-mock-elm327-server
//! Then point obdcast-cli at 127.0.0.1:35000
//!
//! The mock answers AT commands with a shared `ClientState` and serves a
//! plausible electric-vehicle-ish set of mode 01 PIDs with slowly moving
//! values, so the engine's scheduler, parser, and dispatcher all see
//! realistic traffic. The supported-PIDs request is answered by two ECUs
//! so multi-frame parsing gets exercised too.

use clap::Parser;
use log::{debug, info, warn};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Instant;

use obdcast_elm327_lib::ClientState;

#[derive(Parser, Debug)]
#[command(name = "obdcast-mock-elm327")]
#[command(about = "Mock ELM327 adapter server")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0:35000")]
    listen: String,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    info!("Mock ELM327 starting on {}...", args.listen);
    let listener = TcpListener::bind(&args.listen).expect("Failed to bind");
    info!("Mock ELM327 ready - waiting for connections...");

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                info!("Client connected: {:?}", stream.peer_addr());
                std::thread::spawn(|| handle_client(stream));
            }
            Err(e) => warn!("Connection error: {e}"),
        }
    }
}

/// Serve one client: echo input while enabled, cut commands at CR, and
/// answer each through the shared ELM327 state machine.
fn handle_client(mut stream: TcpStream) {
    let start_time = Instant::now();
    let mut state = ClientState::new();
    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 128];

    loop {
        let received = match stream.read(&mut chunk) {
            Ok(0) => {
                info!("Client disconnected");
                return;
            }
            Ok(n) => &chunk[..n],
            Err(e) => {
                warn!("Read error: {e}");
                return;
            }
        };

        if state.echo_enabled && stream.write_all(received).is_err() {
            return;
        }

        for &byte in received {
            match byte {
                b'\r' => {
                    let command = String::from_utf8_lossy(&pending).trim().to_uppercase();
                    pending.clear();
                    if command.is_empty() {
                        continue;
                    }
                    debug!("RX: {command}");
                    let response = process_command(&command, &start_time, &mut state);
                    debug!("TX: {}", response.escape_debug());
                    if let Err(e) = stream.write_all(response.as_bytes()) {
                        warn!("Write error: {e}");
                        return;
                    }
                }
                // Linefeeds are never part of a command
                b'\n' => {}
                _ => pending.push(byte),
            }
        }
    }
}

/// Simulated engine speed: a triangle sweep between idle and a cruise
/// peak so downstream consumers see values that actually change.
fn sim_rpm(start_time: &Instant) -> u16 {
    const IDLE_RPM: u64 = 850;
    const PEAK_RPM: u64 = 3200;
    const SWEEP_MS: u64 = 16_000;

    #[allow(clippy::cast_possible_truncation)]
    let phase_ms = (start_time.elapsed().as_millis() as u64) % SWEEP_MS;
    let half = SWEEP_MS / 2;
    let span = PEAK_RPM - IDLE_RPM;
    let rpm = if phase_ms < half {
        IDLE_RPM + span * phase_ms / half
    } else {
        PEAK_RPM - span * (phase_ms - half) / half
    };
    // Wire encoding is quarter-RPM, two bytes
    (rpm * 4) as u16
}

/// Mode 01 data for the PIDs this mock claims to support. The bitmaps
/// advertise exactly the PIDs answered here.
fn pid_data(pid: &str, start_time: &Instant) -> Option<String> {
    let data = match pid {
        "00" => "08198001".to_string(),                    // supported 01-20
        "05" => "5A".to_string(),                          // coolant 50 degC
        "0C" => format!("{:04X}", sim_rpm(start_time)),    // engine speed
        "0D" => "3C".to_string(),                          // 60 km/h
        "10" => "05DC".to_string(),                        // MAF 15.00 g/s
        "11" => "33".to_string(),                          // throttle 20%
        "20" => "00028001".to_string(),                    // supported 21-40
        "2F" => "80".to_string(),                          // fuel level 50.2%
        "31" => "0190".to_string(),                        // 400 km since clear
        "40" => "40000010".to_string(),                    // supported 41-60
        "42" => "3656".to_string(),                        // 13.91 V
        "5C" => "6E".to_string(),                          // oil 70 degC
        _ => return None,
    };
    Some(data)
}

/// Wrap compact hex data in one response frame, honoring the client's
/// header/space settings. `header` is the responding ECU's address.
fn format_frame(state: &ClientState, header: &str, hex_data: &str) -> String {
    let formatted_data = state.format_response(hex_data.as_bytes());
    let formatted_str = String::from_utf8_lossy(&formatted_data);

    if state.headers_enabled {
        // With headers: "7E8 06 41 00 1E 7F 90 03" (header + length + data)
        let data_bytes = hex_data.len() / 2;
        if state.spaces_enabled {
            format!("{header} {data_bytes:02X} {formatted_str}")
        } else {
            format!("{header}{data_bytes:02X}{formatted_str}")
        }
    } else {
        formatted_str.to_string()
    }
}

fn process_command(cmd: &str, start_time: &Instant, state: &mut ClientState) -> String {
    let le = state.line_ending();

    // Handle AT commands using the shared library
    if cmd.starts_with("AT") {
        // Override AT@1 for mock server identification
        if cmd == "AT@1" {
            return format!("{le}Mock ELM327{le}>");
        }
        return state.handle_at_command(cmd);
    }

    // Mode 01 - current data
    let obd_response = match cmd {
        c if c.starts_with("01") && c.len() >= 4 => {
            let pid = c[2..4].to_uppercase();
            pid_data(&pid, start_time).map(|data| (pid, data))
        }
        _ => None,
    };

    match obd_response {
        Some((pid, data)) => {
            let frame = format_frame(state, "7E8", &format!("41{pid}{data}"));

            // The supported-PIDs request is functional: a second ECU
            // answers too, so clients see a true multi-frame reply
            if pid == "00" && state.headers_enabled {
                let second = format_frame(state, "7E9", "410080000001");
                format!("{frame}{le}{second}{le}{le}>")
            } else {
                format!("{frame}{le}{le}>")
            }
        }
        None => format!("NO DATA{le}{le}>"),
    }
}
