//! Device status bits shared between the engine tasks and the host
//! application: sleep state, engine enable, ECU liveness, shutdown.
//!
//! The scheduler blocks on the sleep/enable bits at the top of each pass;
//! the host flips them from its own threads.

use std::sync::{Condvar, Mutex};

#[derive(Debug, Clone, Copy)]
struct Bits {
    sleeping: bool,
    enabled: bool,
    ecu_connected: bool,
    shutdown: bool,
}

#[derive(Debug)]
pub struct DeviceStatus {
    bits: Mutex<Bits>,
    changed: Condvar,
}

impl Default for DeviceStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceStatus {
    pub fn new() -> Self {
        Self {
            bits: Mutex::new(Bits {
                sleeping: false,
                enabled: true,
                ecu_connected: false,
                shutdown: false,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn is_sleeping(&self) -> bool {
        self.bits.lock().unwrap().sleeping
    }

    pub fn set_sleeping(&self, sleeping: bool) {
        self.bits.lock().unwrap().sleeping = sleeping;
        self.changed.notify_all();
    }

    pub fn is_enabled(&self) -> bool {
        self.bits.lock().unwrap().enabled
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.bits.lock().unwrap().enabled = enabled;
        self.changed.notify_all();
    }

    pub fn ecu_connected(&self) -> bool {
        self.bits.lock().unwrap().ecu_connected
    }

    pub fn set_ecu_connected(&self, connected: bool) {
        self.bits.lock().unwrap().ecu_connected = connected;
    }

    /// Ask both engine tasks to exit at their next pass boundary.
    pub fn request_shutdown(&self) {
        self.bits.lock().unwrap().shutdown = true;
        self.changed.notify_all();
    }

    pub fn shutdown_requested(&self) -> bool {
        self.bits.lock().unwrap().shutdown
    }

    /// Block until the device leaves sleep (or shutdown is requested).
    /// Returns false on shutdown.
    pub fn wait_until_awake(&self) -> bool {
        let mut bits = self.bits.lock().unwrap();
        while bits.sleeping && !bits.shutdown {
            bits = self.changed.wait(bits).unwrap();
        }
        !bits.shutdown
    }

    /// Block until the engine is enabled (or shutdown is requested).
    /// Returns false on shutdown.
    pub fn wait_until_enabled(&self) -> bool {
        let mut bits = self.bits.lock().unwrap();
        while !bits.enabled && !bits.shutdown {
            bits = self.changed.wait(bits).unwrap();
        }
        !bits.shutdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let status = DeviceStatus::new();
        assert!(!status.is_sleeping());
        assert!(status.is_enabled());
        assert!(!status.ecu_connected());
        assert!(!status.shutdown_requested());
    }

    #[test]
    fn test_wait_until_awake_returns_on_wake() {
        let status = Arc::new(DeviceStatus::new());
        status.set_sleeping(true);

        let waiter = {
            let status = Arc::clone(&status);
            std::thread::spawn(move || status.wait_until_awake())
        };
        std::thread::sleep(Duration::from_millis(20));
        status.set_sleeping(false);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_wait_until_enabled_returns_false_on_shutdown() {
        let status = Arc::new(DeviceStatus::new());
        status.set_enabled(false);

        let waiter = {
            let status = Arc::clone(&status);
            std::thread::spawn(move || status.wait_until_enabled())
        };
        std::thread::sleep(Duration::from_millis(20));
        status.request_shutdown();
        assert!(!waiter.join().unwrap());
    }
}
