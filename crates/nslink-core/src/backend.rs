//! The seam between the link tester and the kernel.
//!
//! Every component talks to the host exclusively through [`NetBackend`]:
//! [`crate::iproute::IpRoute2`] drives the real kernel through iproute2,
//! [`crate::sim::SimNet`] models it in memory for `--simulate` and tests.

use std::time::Duration;

use anyhow::Result;
use ipnetwork::IpNetwork;
use serde::Serialize;

use crate::domain::Domain;

/// Operational state as reported by the kernel (`operstate`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperState {
    Up,
    Down,
    Unknown,
    LowerLayerDown,
    Dormant,
    NotPresent,
    Testing,
}

impl OperState {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "UP" => OperState::Up,
            "DOWN" => OperState::Down,
            "LOWERLAYERDOWN" => OperState::LowerLayerDown,
            "DORMANT" => OperState::Dormant,
            "NOTPRESENT" => OperState::NotPresent,
            "TESTING" => OperState::Testing,
            _ => OperState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperState::Up => "up",
            OperState::Down => "down",
            OperState::Unknown => "unknown",
            OperState::LowerLayerDown => "lowerlayerdown",
            OperState::Dormant => "dormant",
            OperState::NotPresent => "notpresent",
            OperState::Testing => "testing",
        }
    }
}

/// Administrative state derived from the `UP` flag and `operstate`.
///
/// `Unknown` covers devices that are flagged up but whose driver never
/// reports an operational state (dummy devices, some tunnels).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AdminState {
    Up,
    Down,
    Unknown,
}

impl AdminState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdminState::Up => "up",
            AdminState::Down => "down",
            AdminState::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AddrScope {
    Global,
    Site,
    Link,
    Host,
}

impl AddrScope {
    pub fn parse(s: &str) -> Self {
        match s {
            "link" => AddrScope::Link,
            "host" => AddrScope::Host,
            "site" => AddrScope::Site,
            _ => AddrScope::Global,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddrInfo {
    #[serde(serialize_with = "serialize_display")]
    pub network: IpNetwork,
    pub scope: AddrScope,
}

impl AddrInfo {
    /// Addresses an operator configured, as opposed to kernel-generated
    /// link-local leftovers.
    pub fn is_assigned(&self) -> bool {
        matches!(self.scope, AddrScope::Global | AddrScope::Site)
    }
}

/// Point-in-time view of one interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkInfo {
    pub name: String,
    pub admin_up: bool,
    pub oper_state: OperState,
    /// `None` when the kernel cannot tell (interface administratively down).
    pub carrier: Option<bool>,
    pub mtu: u32,
    pub link_type: String,
    pub addrs: Vec<AddrInfo>,
}

impl LinkInfo {
    pub fn admin_state(&self) -> AdminState {
        if !self.admin_up {
            AdminState::Down
        } else if self.oper_state == OperState::Unknown {
            AdminState::Unknown
        } else {
            AdminState::Up
        }
    }

    pub fn assigned_addrs(&self) -> impl Iterator<Item = &AddrInfo> {
        self.addrs.iter().filter(|a| a.is_assigned())
    }

    pub fn has_assigned_addr(&self) -> bool {
        self.assigned_addrs().next().is_some()
    }

    pub fn is_loopback(&self) -> bool {
        self.link_type == "loopback" || self.name == "lo"
    }
}

/// Per-interface statistics exposed under `/sys/class/net/<if>/statistics`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stat {
    TxPackets,
    RxPackets,
    RxCrcErrors,
}

impl Stat {
    pub fn file_name(&self) -> &'static str {
        match self {
            Stat::TxPackets => "tx_packets",
            Stat::RxPackets => "rx_packets",
            Stat::RxCrcErrors => "rx_crc_errors",
        }
    }
}

/// Captured result of an external command that ran to completion.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// stdout followed by stderr, the way an operator would have seen it.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }
}

/// A long-running external process started inside a namespace.
pub trait ManagedProcess {
    /// PID of the process as started by the tester.
    fn pid(&self) -> u32;

    /// Poll without blocking.
    fn is_running(&mut self) -> bool;

    /// Whatever the process printed before it died; used to explain a
    /// failed start. Only meaningful once `is_running()` is false.
    fn failure_output(&mut self) -> String;

    /// Graceful-then-forceful stop of this exact PID: SIGTERM, wait up to
    /// `grace`, then SIGKILL. Returns the exit code if one was observed.
    fn terminate(&mut self, grace: Duration) -> Result<Option<i32>>;
}

/// Kernel and process operations needed by the link tester.
///
/// Interface-level methods address an interface *as seen from* `domain`;
/// an interface living in another domain is simply absent there.
pub trait NetBackend {
    /// `Ok(None)` when the interface does not exist in `domain`.
    fn link(&self, domain: Domain<'_>, iface: &str) -> Result<Option<LinkInfo>>;

    fn links(&self, domain: Domain<'_>) -> Result<Vec<LinkInfo>>;

    fn set_admin(&self, domain: Domain<'_>, iface: &str, up: bool) -> Result<()>;

    fn set_mtu(&self, domain: Domain<'_>, iface: &str, mtu: u32) -> Result<()>;

    fn flush_addrs(&self, domain: Domain<'_>, iface: &str) -> Result<()>;

    fn add_addr(&self, domain: Domain<'_>, iface: &str, addr: &IpNetwork) -> Result<()>;

    /// Re-parent `iface` from `from` into `to`, as one kernel operation.
    fn move_link(&self, from: Domain<'_>, iface: &str, to: Domain<'_>) -> Result<()>;

    /// Names of existing named namespaces.
    fn domains(&self) -> Result<Vec<String>>;

    fn add_domain(&self, name: &str) -> Result<()>;

    fn del_domain(&self, name: &str) -> Result<()>;

    fn read_stat(&self, domain: &str, iface: &str, stat: Stat) -> Result<u64>;

    /// Run a command inside `domain` to completion, capturing its output.
    /// A non-zero exit is *not* an error here.
    fn exec(&self, domain: &str, program: &str, args: &[String]) -> Result<CommandOutput>;

    /// Start a command inside `domain` without waiting for it.
    fn spawn(&self, domain: &str, program: &str, args: &[String])
        -> Result<Box<dyn ManagedProcess>>;

    /// Blink the interface's hardware indicator for `duration`.
    fn identify(&self, iface: &str, duration: Duration) -> Result<()>;

    /// Wall-clock wait between steps (settling, warm-up, polling).
    fn pause(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn domain_exists(&self, name: &str) -> Result<bool> {
        Ok(self.domains()?.iter().any(|d| d == name))
    }
}

fn serialize_display<S, T>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
    T: std::fmt::Display,
{
    serializer.collect_str(value)
}
