//! ELM327 protocol primitives for OBD2 communication
//!
//! This library provides the pieces of the ELM327 text protocol that are
//! shared between the obdcast engine (which drives a real adapter), the
//! mock adapter server, and tests: command framing, prompt detection,
//! negative-reply classification, and a per-connection `ClientState` for
//! emulating an adapter.

/// The adapter signals end-of-reply with this prompt byte.
pub const PROMPT: u8 = b'>';

/// Per-connection adapter state (ELM327 settings)
#[derive(Debug, Clone)]
#[allow(clippy::struct_excessive_bools)] // These are independent ELM327 protocol flags
pub struct ClientState {
    /// Echo received characters back (ATE0/ATE1)
    pub echo_enabled: bool,
    /// Add linefeeds after carriage returns (ATL0/ATL1)
    pub linefeeds_enabled: bool,
    /// Print spaces between response bytes (ATS0/ATS1)
    pub spaces_enabled: bool,
    /// Show header bytes in responses (ATH0/ATH1)
    pub headers_enabled: bool,
    /// Currently selected protocol number (ATTP/ATSP), 0 = automatic
    pub protocol: u8,
    /// Whether the protocol was selected automatically (ATSP0/ATTP0)
    pub protocol_auto: bool,
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            echo_enabled: true,
            linefeeds_enabled: true,
            spaces_enabled: true,
            headers_enabled: false,
            protocol: 0,
            protocol_auto: true,
        }
    }
}

impl ClientState {
    /// Create a new client state with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Format a line ending based on current settings
    pub fn line_ending(&self) -> &'static str {
        if self.linefeeds_enabled {
            "\r\n"
        } else {
            "\r"
        }
    }

    /// Format a reply payload according to client settings
    /// The emulated ECU produces compact hex (no spaces), so we add spaces if enabled
    pub fn format_response(&self, response: &[u8]) -> Vec<u8> {
        if !self.spaces_enabled {
            // No formatting needed, return as-is
            return response.to_vec();
        }

        let mut result = Vec::with_capacity(response.len() * 3 / 2);
        let mut hex_count = 0;

        for &byte in response {
            // Check if this is a hex digit
            let is_hex = byte.is_ascii_hexdigit();

            if is_hex {
                // Add space before every pair of hex digits (except the first)
                if hex_count > 0 && hex_count % 2 == 0 {
                    result.push(b' ');
                }
                hex_count += 1;
            } else {
                // Reset hex count on non-hex (line endings, prompt, etc.)
                hex_count = 0;
            }

            result.push(byte);
        }

        result
    }

    /// Handle an AT command and return the response
    /// Mutates the state if the command changes settings
    pub fn handle_at_command(&mut self, command: &str) -> String {
        let cmd = command.to_uppercase();
        let le = self.line_ending();

        // Determine response content (without line endings)
        let response_text = match cmd.as_str() {
            "ATZ" | "ATWS" => {
                // Reset all settings to defaults
                *self = ClientState::default();
                // Use new state's line ending for response
                let le = self.line_ending();
                return format!("{le}ELM327 v1.5{le}>");
            }
            "ATE0" => {
                self.echo_enabled = false;
                "OK"
            }
            "ATE1" => {
                self.echo_enabled = true;
                "OK"
            }
            "ATL0" => {
                self.linefeeds_enabled = false;
                "OK"
            }
            "ATL1" => {
                self.linefeeds_enabled = true;
                "OK"
            }
            "ATS0" => {
                self.spaces_enabled = false;
                "OK"
            }
            "ATS1" => {
                self.spaces_enabled = true;
                "OK"
            }
            "ATH0" => {
                self.headers_enabled = false;
                "OK"
            }
            "ATH1" => {
                self.headers_enabled = true;
                "OK"
            }
            "ATDPN" => {
                // Describe protocol by number; auto-selected protocols get an 'A' prefix
                let le = self.line_ending();
                return if self.protocol_auto && self.protocol != 0 {
                    format!("{le}A{:X}{le}>", self.protocol)
                } else {
                    format!("{le}{:X}{le}>", self.protocol)
                };
            }
            _ if cmd.starts_with("ATSP") || cmd.starts_with("ATTP") => {
                if let Ok(p) = u8::from_str_radix(&cmd[4..], 16) {
                    self.protocol_auto = p == 0;
                    self.protocol = p;
                }
                "OK"
            }
            _ if cmd.starts_with("ATSH") => "OK",
            _ if cmd.starts_with("ATCRA") => "OK",
            _ if cmd.starts_with("ATST") => "OK",
            _ if cmd.starts_with("ATAT") => "OK",
            _ if cmd.starts_with("ATM") => "OK",
            "ATI" => "ELM327 v1.5",
            "AT@1" => return self.device_description(),
            _ => "?",
        };

        // Build response with proper line endings (echo already sent)
        // Note: for commands that change linefeed setting, we use the OLD setting
        // since le was captured before the match
        format!("{le}{response_text}{le}>")
    }

    /// Override this to provide a custom device description for AT@1
    /// Default implementation returns generic ELM327
    pub fn device_description(&self) -> String {
        let le = self.line_ending();
        format!("{le}ELM327{le}>")
    }
}

/// Terminate a command with a carriage return if it isn't already
pub fn ensure_cr(command: &[u8]) -> Vec<u8> {
    let mut cmd = command.to_vec();
    if !cmd.ends_with(b"\r") {
        cmd.push(b'\r');
    }
    cmd
}

/// Check whether an accumulated reply contains the prompt byte yet
pub fn has_prompt(buffer: &[u8]) -> bool {
    buffer.contains(&PROMPT)
}

/// Negative replies the adapter or ECU can produce instead of data
const NEGATIVE_REPLIES: [&str; 7] = [
    "NO DATA",
    "ERROR",
    "SEARCHING",
    "UNABLE TO CONNECT",
    "CAN ERROR",
    "BUS ERROR",
    "STOPPED",
];

/// True if the reply text is an adapter/ECU negative response rather than data
pub fn is_negative_reply(reply: &str) -> bool {
    let upper = reply.to_uppercase();
    NEGATIVE_REPLIES.iter().any(|neg| upper.contains(neg))
}

/// Parse the reply to `ATDPN` (describe protocol by number).
///
/// Auto-selected protocols carry an `A` prefix (`A6`); the digit itself is
/// hex since protocols go up to C.
pub fn parse_dpn_reply(reply: &str) -> Option<u8> {
    let token: String = reply
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect();
    let digits = match token.strip_prefix(['A', 'a']) {
        // A bare "A" is protocol 10, not an empty auto prefix
        Some(rest) if !rest.is_empty() => rest,
        _ => token.as_str(),
    };
    match u8::from_str_radix(digits, 16) {
        Ok(p) if p <= 0x0C => Some(p),
        _ => None,
    }
}

/// Commands that must never reach the adapter from the polling hot path.
///
/// `ATH0` drops headers, `ATS0` drops spaces, and `ATE1` re-enables echo;
/// any of them would silently break the response parser's framing
/// assumptions. Matches case-insensitively and with an embedded space
/// (`AT H0` is accepted by real adapters).
pub fn is_forbidden_hot_command(command: &str) -> bool {
    let upper: String = command
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase();
    upper.contains("ATH0") || upper.contains("ATS0") || upper.contains("ATE1")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state() {
        let state = ClientState::default();
        assert!(state.echo_enabled);
        assert!(state.linefeeds_enabled);
        assert!(state.spaces_enabled);
        assert!(!state.headers_enabled);
        assert_eq!(state.protocol, 0);
    }

    #[test]
    fn test_line_ending() {
        let mut state = ClientState::default();
        assert_eq!(state.line_ending(), "\r\n");

        state.linefeeds_enabled = false;
        assert_eq!(state.line_ending(), "\r");
    }

    #[test]
    fn test_at_commands() {
        let mut state = ClientState::default();

        // Test echo off
        let resp = state.handle_at_command("ATE0");
        assert!(resp.contains("OK"));
        assert!(!state.echo_enabled);

        // Test spaces off
        let resp = state.handle_at_command("ATS0");
        assert!(resp.contains("OK"));
        assert!(!state.spaces_enabled);

        // Test reset
        let resp = state.handle_at_command("ATZ");
        assert!(resp.contains("ELM327"));
        assert!(state.echo_enabled);
        assert!(state.spaces_enabled);
    }

    #[test]
    fn test_protocol_selection() {
        let mut state = ClientState::default();

        let resp = state.handle_at_command("ATTP6");
        assert!(resp.contains("OK"));
        assert_eq!(state.protocol, 6);
        assert!(!state.protocol_auto);

        let resp = state.handle_at_command("ATDPN");
        assert!(resp.contains('6'));
        assert!(!resp.contains("A6"));

        // ATSP0 returns to automatic; a later search result keeps the prefix
        state.handle_at_command("ATSP0");
        assert!(state.protocol_auto);
        state.protocol = 6;
        let resp = state.handle_at_command("ATDPN");
        assert!(resp.contains("A6"));
    }

    #[test]
    fn test_format_response_with_spaces() {
        let state = ClientState::default();
        let input = b"410C1AF8\r\r>";
        let output = state.format_response(input);
        assert_eq!(&output, b"41 0C 1A F8\r\r>");
    }

    #[test]
    fn test_format_response_without_spaces() {
        let mut state = ClientState::default();
        state.spaces_enabled = false;
        let input = b"410C1AF8\r\r>";
        let output = state.format_response(input);
        assert_eq!(&output, b"410C1AF8\r\r>");
    }

    #[test]
    fn test_ensure_cr() {
        assert_eq!(ensure_cr(b"ATZ"), b"ATZ\r");
        assert_eq!(ensure_cr(b"ATZ\r"), b"ATZ\r");
    }

    #[test]
    fn test_negative_replies() {
        assert!(is_negative_reply("SEARCHING...\r\r>"));
        assert!(is_negative_reply("\r\nNO DATA\r\n>"));
        assert!(is_negative_reply("unable to connect\r>"));
        assert!(is_negative_reply("CAN ERROR\r>"));
        assert!(!is_negative_reply("41 0C 1A F8\r\r>"));
    }

    #[test]
    fn test_parse_dpn_reply() {
        assert_eq!(parse_dpn_reply("A6\r\r>"), Some(6));
        assert_eq!(parse_dpn_reply("\r\n6\r\n>"), Some(6));
        assert_eq!(parse_dpn_reply("A"), Some(10));
        assert_eq!(parse_dpn_reply("AC\r>"), Some(12));
        assert_eq!(parse_dpn_reply("?\r>"), None);
        assert_eq!(parse_dpn_reply(""), None);
    }

    #[test]
    fn test_forbidden_hot_commands() {
        assert!(is_forbidden_hot_command("ATH0\r"));
        assert!(is_forbidden_hot_command("ath0"));
        assert!(is_forbidden_hot_command("AT H0"));
        assert!(is_forbidden_hot_command("ats0\r"));
        assert!(is_forbidden_hot_command("ATE1"));
        assert!(!is_forbidden_hot_command("ATH1\r"));
        assert!(!is_forbidden_hot_command("ATS1"));
        assert!(!is_forbidden_hot_command("ATE0"));
        assert!(!is_forbidden_hot_command("010C\r"));
    }
}
