//! Adapter task: owns the single connection to the ELM327 adapter.
//!
//! The task receives commands over a channel, writes them CR-terminated,
//! and accumulates the reply into a reused scratch buffer until the `>`
//! prompt arrives. Connection setup and reconnection (with a short delay)
//! happen inside the task; callers only ever see `AdapterError`.

use derive_more::{Display, Error};
use log::{debug, error, info, warn};
use obdcast_elm327_lib::{ensure_cr, has_prompt};
use smallvec::SmallVec;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant};

/// Scratch buffer size for reply accumulation; replies larger than this
/// only cost a reallocation.
pub const SCRATCH_CAPACITY: usize = 4096;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// Minimum gap between back-to-back commands; some adapters drop input
/// arriving while they are still printing the previous prompt.
const COMMAND_GAP: Duration = Duration::from_millis(20);

/// Type alias for small command buffers
pub type CommandBuffer = SmallVec<u8, 16>;

/// Request to the adapter task
pub struct AdapterRequest {
    /// The command to send (CR appended if missing)
    pub command: CommandBuffer,
    /// How long to wait for the prompt
    pub timeout: Duration,
    /// Channel to send the response back (None = fire-and-forget)
    pub response_tx: Option<oneshot::Sender<Result<Vec<u8>, AdapterError>>>,
}

/// Errors from the adapter task
#[derive(Debug, Clone, Display, Error)]
pub enum AdapterError {
    #[display("Not connected to adapter")]
    NotConnected,
    #[display("Adapter timeout")]
    Timeout,
    #[display("Adapter disconnected")]
    Disconnected,
    #[display("IO error: {_0}")]
    Io(#[error(not(source))] String),
}

impl AdapterError {
    /// Convert to ELM327-style error message
    pub fn to_elm327_error(&self) -> &'static str {
        match self {
            Self::NotConnected => "UNABLE TO CONNECT",
            Self::Timeout => "NO DATA",
            Self::Disconnected => "CAN ERROR",
            Self::Io(_) => "BUS ERROR",
        }
    }
}

/// Byte transport to the adapter. TCP in production; tests may plug in
/// anything.
pub trait Transport: Read + Write + Send {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()>;
}

impl Transport for TcpStream {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> std::io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }
}

/// Builds (or rebuilds) the transport; called on connect and reconnect.
pub type Connector = Box<dyn FnMut() -> Option<Box<dyn Transport>> + Send>;

pub type AdapterSender = Sender<AdapterRequest>;

/// Connector for WiFi/TCP adapters.
pub fn tcp_connector(addr: String, connect_timeout: Duration) -> Connector {
    Box::new(move || {
        let sock_addr: SocketAddr = match addr.parse() {
            Ok(a) => a,
            Err(e) => {
                error!("Invalid adapter address {addr}: {e}");
                return None;
            }
        };
        let mut stream = match TcpStream::connect_timeout(&sock_addr, connect_timeout) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to connect to adapter: {e}");
                return None;
            }
        };
        // Short read timeout so reply accumulation can poll its deadline
        if let Err(e) = Transport::set_read_timeout(&mut stream, Some(Duration::from_millis(100))) {
            error!("Failed to set read timeout: {e}");
            return None;
        }
        if let Err(e) = stream.set_write_timeout(Some(connect_timeout)) {
            error!("Failed to set write timeout: {e}");
            return None;
        }
        info!("Connected to OBD2 adapter at {addr}");
        Some(Box::new(stream) as Box<dyn Transport>)
    })
}

/// Start the adapter task and return a sender for requests
pub fn start_adapter_task(connector: Connector) -> AdapterSender {
    let (tx, rx) = mpsc::channel();
    crate::thread_util::spawn_named("obd_adapter", move || {
        adapter_task(&rx, connector);
    });
    tx
}

/// The adapter task - owns the connection and processes requests
fn adapter_task(rx: &Receiver<AdapterRequest>, mut connector: Connector) {
    info!("Adapter task starting...");

    let mut connection: Option<Box<dyn Transport>> = None;
    let mut last_connect_attempt: Option<Instant> = None;
    let mut last_cmd_time: Option<Instant> = None;
    let mut scratch: Vec<u8> = Vec::with_capacity(SCRATCH_CAPACITY);

    loop {
        // Try to ensure we have a connection (with reconnect delay)
        if connection.is_none() {
            let should_try = last_connect_attempt.map_or(true, |t| t.elapsed() >= RECONNECT_DELAY);
            if should_try {
                last_connect_attempt = Some(Instant::now());
                connection = connector();
            }
        }

        // Process requests with a timeout so we can check connection health
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(request) => {
                debug!(
                    "Adapter request: {:?}",
                    String::from_utf8_lossy(&request.command)
                );
                let result = if let Some(stream) = connection.as_mut() {
                    throttle(&mut last_cmd_time);
                    execute_command(stream.as_mut(), &request.command, request.timeout, &mut scratch)
                } else {
                    Err(AdapterError::NotConnected)
                };

                // If we got a disconnect error, drop the connection
                if matches!(
                    result,
                    Err(AdapterError::Disconnected | AdapterError::Io(_))
                ) {
                    warn!("Adapter connection lost, will reconnect");
                    connection = None;
                }

                match &result {
                    Ok(reply) => debug!("Adapter response: {} bytes", reply.len()),
                    Err(e) => debug!("Adapter response error: {e}"),
                }

                // Send response if caller is waiting (fire-and-forget has None)
                if let Some(response_tx) = request.response_tx {
                    let _ = response_tx.send(result);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                // No request, just keep the loop alive
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                info!("Adapter task channel closed, shutting down");
                break;
            }
        }
    }
}

/// Enforce the minimum inter-command gap.
fn throttle(last_cmd_time: &mut Option<Instant>) {
    if let Some(last) = *last_cmd_time {
        let elapsed = last.elapsed();
        if elapsed < COMMAND_GAP {
            std::thread::sleep(COMMAND_GAP - elapsed);
        }
    }
    *last_cmd_time = Some(Instant::now());
}

/// Execute a command on the adapter and return the accumulated reply
fn execute_command(
    stream: &mut dyn Transport,
    command: &[u8],
    timeout: Duration,
    scratch: &mut Vec<u8>,
) -> Result<Vec<u8>, AdapterError> {
    let cmd = ensure_cr(command);

    debug!("Sending to adapter: {:?}", String::from_utf8_lossy(&cmd));

    stream
        .write_all(&cmd)
        .map_err(|e| AdapterError::Io(e.to_string()))?;

    scratch.clear();
    let mut buffer = [0u8; 256];
    let start = Instant::now();

    loop {
        match stream.read(&mut buffer) {
            Ok(0) => return Err(AdapterError::Disconnected),
            Ok(n) => {
                scratch.extend_from_slice(&buffer[..n]);
                debug!("Read {} bytes from adapter, total: {}", n, scratch.len());
                // Reply is complete once the prompt arrives
                if has_prompt(scratch) {
                    debug!("Complete response: {:?}", String::from_utf8_lossy(scratch));
                    break;
                }
                if start.elapsed() > timeout {
                    return Err(AdapterError::Timeout);
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                if start.elapsed() > timeout {
                    return Err(AdapterError::Timeout);
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(AdapterError::Io(e.to_string())),
        }
    }

    Ok(scratch.clone())
}

/// Send a command to the adapter and wait for the reply
pub fn send_command(
    adapter: &AdapterSender,
    command: &[u8],
    timeout: Duration,
) -> Result<Vec<u8>, AdapterError> {
    let (response_tx, response_rx) = oneshot::channel();
    let request = AdapterRequest {
        command: command.iter().copied().collect(),
        timeout,
        response_tx: Some(response_tx),
    };

    adapter
        .send(request)
        .map_err(|_| AdapterError::NotConnected)?;

    // Slack on top of the adapter-side timeout covers throttling and a
    // reconnect attempt
    response_rx
        .recv_timeout(timeout + Duration::from_secs(2))
        .map_err(|_| AdapterError::Timeout)?
}

/// Send a command without waiting for the reply (fire-and-forget)
pub fn send_command_async(adapter: &AdapterSender, command: &[u8], timeout: Duration) {
    let request = AdapterRequest {
        command: command.iter().copied().collect(),
        timeout,
        response_tx: None,
    };
    let _ = adapter.send(request);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    /// Minimal prompt-speaking peer: replies to every CR-terminated line.
    fn spawn_mock(reply: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 256];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if buf[..n].contains(&b'\r') {
                            if stream.write_all(reply.as_bytes()).is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        });
        addr
    }

    #[test]
    fn test_send_command_roundtrip() {
        let addr = spawn_mock("41 0C 1A F8\r\r>");
        let adapter = start_adapter_task(tcp_connector(addr, Duration::from_secs(1)));

        let reply = send_command(&adapter, b"010C", Duration::from_secs(2)).unwrap();
        assert_eq!(reply, b"41 0C 1A F8\r\r>");
    }

    #[test]
    fn test_send_command_without_server() {
        let connector: Connector = Box::new(|| None);
        let adapter = start_adapter_task(connector);
        let err = send_command(&adapter, b"010C", Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, AdapterError::NotConnected));
    }

    #[test]
    fn test_reply_without_prompt_times_out() {
        let addr = spawn_mock("41 0C 1A F8\r\r");
        let adapter = start_adapter_task(tcp_connector(addr, Duration::from_secs(1)));
        let err = send_command(&adapter, b"010C", Duration::from_millis(300)).unwrap_err();
        assert!(matches!(err, AdapterError::Timeout));
    }

    #[test]
    fn test_elm327_error_strings() {
        assert_eq!(AdapterError::NotConnected.to_elm327_error(), "UNABLE TO CONNECT");
        assert_eq!(AdapterError::Timeout.to_elm327_error(), "NO DATA");
        assert_eq!(AdapterError::Disconnected.to_elm327_error(), "CAN ERROR");
        assert_eq!(
            AdapterError::Io("boom".to_string()).to_elm327_error(),
            "BUS ERROR"
        );
    }
}
