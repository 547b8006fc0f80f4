//! Single-slot cell for the active CAN protocol number.
//!
//! The adapter reports its negotiated protocol once (via `ATDPN`); the
//! frame parser consults it on every reply to compute header stripping.

use std::sync::Mutex;

/// Value meaning "no protocol known yet".
pub const PROTOCOL_UNKNOWN: i32 = -1;

/// Holds the currently active CAN protocol number.
///
/// `set` replaces the slot atomically; `peek` reads without consuming.
#[derive(Debug)]
pub struct ProtocolCell {
    slot: Mutex<i32>,
}

impl Default for ProtocolCell {
    fn default() -> Self {
        Self::new()
    }
}

impl ProtocolCell {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(PROTOCOL_UNKNOWN),
        }
    }

    pub fn set(&self, protocol: i32) {
        *self.slot.lock().unwrap() = protocol;
        log::info!("Protocol number set to: {protocol}");
    }

    pub fn peek(&self) -> i32 {
        *self.slot.lock().unwrap()
    }
}
