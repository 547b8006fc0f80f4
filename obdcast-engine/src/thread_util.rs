//! Helper for spawning the engine's long-lived worker threads.

use std::thread::JoinHandle;

/// Spawn a thread with a name, panicking only if the OS refuses to spawn.
///
/// # Example
/// ```ignore
/// spawn_named("obd_adapter", || { /* ... */ });
/// ```
pub fn spawn_named<F, T>(name: &str, f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .unwrap_or_else(|e| panic!("Failed to spawn thread {name}: {e}"))
}
