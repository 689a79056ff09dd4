//! Helpers for tests that need a real kernel.

use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::config::IFNAME_MAX;
use crate::domain::running_as_root;

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Effective uid 0 and a working `ip netns`. Privileged tests skip
/// themselves when this is false.
pub fn check_privileges() -> bool {
    if !running_as_root() {
        return false;
    }
    Command::new("ip")
        .args(["netns", "list"])
        .output()
        .is_ok_and(|o| o.status.success())
}

/// Whether `program` can be started (e.g. `iperf3`).
pub fn tool_available(program: &str) -> bool {
    Command::new(program).arg("--version").output().is_ok()
}

/// A name unique across parallel tests in this process, short enough to
/// be an interface name.
pub fn unique_name(prefix: &str) -> String {
    let seq = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut name = format!("{prefix}{:x}{seq}", std::process::id() % 0xFFFF);
    name.truncate(IFNAME_MAX);
    name
}
