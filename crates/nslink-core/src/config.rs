//! Link, test and host settings: TOML input, overlay, validation.

use std::path::PathBuf;
use std::time::Duration;

use ipnetwork::IpNetwork;
use rand::Rng;
use serde::Deserialize;

use crate::error::LinkError;

pub const CONFIG_VERSION: u32 = 1;
pub const DEFAULT_PREFIX: &str = "nslink";
pub const DEFAULT_SRC_ADDR: &str = "10.10.10.1/30";
pub const DEFAULT_DST_ADDR: &str = "10.10.10.2/30";
pub const DEFAULT_MTU: u32 = 1500;
pub const EPHEMERAL_PORT_MIN: u16 = 49152;

/// Linux `IFNAMSIZ` minus the terminating NUL.
pub const IFNAME_MAX: usize = 15;

// ── File/CLI input (all optional) ───────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConfigInput {
    pub version: u32,
    pub link: LinkInput,
    pub test: TestInput,
    pub guard: GuardInput,
    pub state: StateInput,
    pub tools: ToolsInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LinkInput {
    pub src_if: Option<String>,
    pub dst_if: Option<String>,
    pub src_ip: Option<String>,
    pub dst_ip: Option<String>,
    pub mtu: Option<u32>,
    pub auto: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TestInput {
    /// `throughput`, `rate` or `flood`.
    pub mode: Option<String>,
    pub bitrate: Option<String>,
    pub duration_s: Option<u64>,
    pub size: Option<u32>,
    pub port: Option<u16>,
    pub warmup_ms: Option<u64>,
    pub settle_ms: Option<u64>,
    pub stop_grace_ms: Option<u64>,
    pub carrier_wait_ms: Option<u64>,
    pub json_output: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GuardInput {
    pub accept_unknown: Option<bool>,
    pub require_carrier: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StateInput {
    pub dir: Option<PathBuf>,
    pub prefix: Option<String>,
    pub keep: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ToolsInput {
    pub sudo: Option<bool>,
    pub ip: Option<String>,
    pub iperf3: Option<String>,
    pub ping: Option<String>,
    pub ethtool: Option<String>,
}

// ── Resolved configuration ──────────────────────────────────────────

/// Which interfaces to adopt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Explicit { src_if: String, dst_if: String },
    Auto,
}

/// Interfaces and addressing for one topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    pub src_if: String,
    pub dst_if: String,
    pub src_addr: IpNetwork,
    pub dst_addr: IpNetwork,
    pub mtu: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestMode {
    /// iperf3 default (TCP) run; loss and throughput.
    Throughput,
    /// iperf3 UDP at a fixed bit-rate; additionally reports jitter.
    Rate { bitrate: String },
    /// ICMP echo flood, no responder.
    Flood,
}

impl TestMode {
    pub fn name(&self) -> &'static str {
        match self {
            TestMode::Throughput => "throughput",
            TestMode::Rate { .. } => "rate",
            TestMode::Flood => "flood",
        }
    }

    pub fn needs_responder(&self) -> bool {
        !matches!(self, TestMode::Flood)
    }
}

#[derive(Debug, Clone)]
pub struct TestConfig {
    pub mode: TestMode,
    pub duration: Duration,
    /// Payload size; `None` leaves the tool's default.
    pub size: Option<u32>,
    pub port: u16,
    pub warmup: Duration,
    pub settle: Duration,
    pub stop_grace: Duration,
    pub carrier_wait: Duration,
    /// Ask iperf3 for JSON (`-J`) instead of its text report.
    pub json_output: bool,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            mode: TestMode::Throughput,
            duration: Duration::from_secs(10),
            size: None,
            port: EPHEMERAL_PORT_MIN,
            warmup: Duration::from_secs(2),
            settle: Duration::from_secs(1),
            stop_grace: Duration::from_secs(2),
            carrier_wait: Duration::from_secs(5),
            json_output: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardPolicy {
    pub require_down: bool,
    pub accept_unknown: bool,
    pub require_carrier: bool,
}

impl Default for GuardPolicy {
    fn default() -> Self {
        Self {
            require_down: true,
            accept_unknown: false,
            require_carrier: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolPaths {
    pub ip: String,
    pub iperf3: String,
    pub ping: String,
    pub ethtool: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            ip: "ip".into(),
            iperf3: "iperf3".into(),
            ping: "ping".into(),
            ethtool: "ethtool".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub state_dir: PathBuf,
    pub prefix: String,
    pub use_sudo: bool,
    pub keep: bool,
    pub tools: ToolPaths,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            prefix: DEFAULT_PREFIX.into(),
            use_sudo: false,
            keep: false,
            tools: ToolPaths::default(),
        }
    }
}

pub fn default_state_dir() -> PathBuf {
    std::env::temp_dir().join("nslink")
}

#[derive(Debug, Clone)]
pub struct Config {
    pub version: u32,
    pub selection: Selection,
    pub src_addr: IpNetwork,
    pub dst_addr: IpNetwork,
    pub mtu: u32,
    pub test: TestConfig,
    pub guard: GuardPolicy,
    pub settings: Settings,
}

impl Config {
    pub fn from_toml_str(input: &str) -> Result<Self, LinkError> {
        ConfigInput::from_toml_str(input)?.resolve()
    }

    /// Bind concrete interfaces to the configured addressing.
    pub fn link_for(&self, src_if: &str, dst_if: &str) -> Result<LinkConfig, LinkError> {
        check_interface_pair(src_if, dst_if)?;
        Ok(LinkConfig {
            src_if: src_if.to_string(),
            dst_if: dst_if.to_string(),
            src_addr: self.src_addr,
            dst_addr: self.dst_addr,
            mtu: self.mtu,
        })
    }
}

impl ConfigInput {
    pub fn from_toml_str(input: &str) -> Result<Self, LinkError> {
        if input.trim().is_empty() {
            return Ok(ConfigInput::default());
        }
        toml::from_str(input).map_err(|e| LinkError::Config(format!("invalid config TOML: {e}")))
    }

    /// Layer `over` on top of `self`; any value set in `over` wins.
    pub fn overlay(self, over: ConfigInput) -> ConfigInput {
        ConfigInput {
            version: if over.version != 0 { over.version } else { self.version },
            link: LinkInput {
                src_if: over.link.src_if.or(self.link.src_if),
                dst_if: over.link.dst_if.or(self.link.dst_if),
                src_ip: over.link.src_ip.or(self.link.src_ip),
                dst_ip: over.link.dst_ip.or(self.link.dst_ip),
                mtu: over.link.mtu.or(self.link.mtu),
                auto: over.link.auto.or(self.link.auto),
            },
            test: TestInput {
                mode: over.test.mode.or(self.test.mode),
                bitrate: over.test.bitrate.or(self.test.bitrate),
                duration_s: over.test.duration_s.or(self.test.duration_s),
                size: over.test.size.or(self.test.size),
                port: over.test.port.or(self.test.port),
                warmup_ms: over.test.warmup_ms.or(self.test.warmup_ms),
                settle_ms: over.test.settle_ms.or(self.test.settle_ms),
                stop_grace_ms: over.test.stop_grace_ms.or(self.test.stop_grace_ms),
                carrier_wait_ms: over.test.carrier_wait_ms.or(self.test.carrier_wait_ms),
                json_output: over.test.json_output.or(self.test.json_output),
            },
            guard: GuardInput {
                accept_unknown: over.guard.accept_unknown.or(self.guard.accept_unknown),
                require_carrier: over.guard.require_carrier.or(self.guard.require_carrier),
            },
            state: StateInput {
                dir: over.state.dir.or(self.state.dir),
                prefix: over.state.prefix.or(self.state.prefix),
                keep: over.state.keep.or(self.state.keep),
            },
            tools: ToolsInput {
                sudo: over.tools.sudo.or(self.tools.sudo),
                ip: over.tools.ip.or(self.tools.ip),
                iperf3: over.tools.iperf3.or(self.tools.iperf3),
                ping: over.tools.ping.or(self.tools.ping),
                ethtool: over.tools.ethtool.or(self.tools.ethtool),
            },
        }
    }

    pub fn resolve(self) -> Result<Config, LinkError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(LinkError::Config(format!("unsupported config version {version}")));
        }

        let auto = self.link.auto.unwrap_or(false);
        let selection = match (trimmed(self.link.src_if), trimmed(self.link.dst_if)) {
            (Some(src_if), Some(dst_if)) if !auto => {
                check_interface_pair(&src_if, &dst_if)?;
                Selection::Explicit { src_if, dst_if }
            }
            (None, None) if auto => Selection::Auto,
            (_, _) if auto => {
                return Err(LinkError::Config(
                    "--auto cannot be combined with --src-if/--dst-if".into(),
                ))
            }
            _ => {
                return Err(LinkError::Config(
                    "both --src-if and --dst-if are required (or use --auto)".into(),
                ))
            }
        };

        let src_addr = parse_cidr("source", self.link.src_ip.as_deref().unwrap_or(DEFAULT_SRC_ADDR))?;
        let dst_addr = parse_cidr("destination", self.link.dst_ip.as_deref().unwrap_or(DEFAULT_DST_ADDR))?;
        check_addr_pair(&src_addr, &dst_addr)?;

        let mtu = self.link.mtu.unwrap_or(DEFAULT_MTU);
        if !(68..=65535).contains(&mtu) {
            return Err(LinkError::Config(format!("MTU {mtu} outside 68..=65535")));
        }

        let test = resolve_test(self.test)?;

        let guard = GuardPolicy {
            // Auto-selected candidates are up by definition.
            require_down: !auto,
            accept_unknown: self.guard.accept_unknown.unwrap_or(false),
            require_carrier: self.guard.require_carrier.unwrap_or(false),
        };

        let settings = resolve_settings(self.state, self.tools)?;

        Ok(Config {
            version,
            selection,
            src_addr,
            dst_addr,
            mtu,
            test,
            guard,
            settings,
        })
    }

    /// Only the state and tool settings; enough for `--cleanup` and
    /// `--detect`, which adopt no interfaces.
    pub fn resolve_settings(&self) -> Result<Settings, LinkError> {
        resolve_settings(self.state.clone(), self.tools.clone())
    }
}

fn resolve_settings(state: StateInput, tools: ToolsInput) -> Result<Settings, LinkError> {
    let defaults = ToolPaths::default();
    let prefix = trimmed(state.prefix).unwrap_or_else(|| DEFAULT_PREFIX.into());
    if prefix.contains('/') || prefix.contains(char::is_whitespace) {
        return Err(LinkError::Config(format!("invalid namespace prefix '{prefix}'")));
    }
    Ok(Settings {
        state_dir: state.dir.unwrap_or_else(default_state_dir),
        prefix,
        use_sudo: tools.sudo.unwrap_or(false),
        keep: state.keep.unwrap_or(false),
        tools: ToolPaths {
            ip: tools.ip.unwrap_or(defaults.ip),
            iperf3: tools.iperf3.unwrap_or(defaults.iperf3),
            ping: tools.ping.unwrap_or(defaults.ping),
            ethtool: tools.ethtool.unwrap_or(defaults.ethtool),
        },
    })
}

fn resolve_test(input: TestInput) -> Result<TestConfig, LinkError> {
    let defaults = TestConfig::default();
    let bitrate = trimmed(input.bitrate);
    let mode = match (input.mode.as_deref().map(str::trim), bitrate) {
        (Some("flood"), _) => TestMode::Flood,
        (Some("throughput"), None) | (None, None) => TestMode::Throughput,
        (Some("throughput"), Some(_)) => {
            return Err(LinkError::Config("a bit-rate only applies to rate mode (--udp)".into()))
        }
        (Some("rate") | None, Some(bitrate)) => {
            if !is_valid_bitrate(&bitrate) {
                return Err(LinkError::Config(format!(
                    "invalid bit-rate '{bitrate}' (expected e.g. 100M, 1.5G, 800K)"
                )));
            }
            TestMode::Rate { bitrate }
        }
        (Some("rate"), None) => {
            return Err(LinkError::Config("rate mode requires a bit-rate (--rate)".into()))
        }
        (Some(other), _) => {
            return Err(LinkError::Config(format!("unknown test mode '{other}'")))
        }
    };

    let duration = Duration::from_secs(input.duration_s.unwrap_or(defaults.duration.as_secs()));
    if duration.is_zero() {
        return Err(LinkError::Config("duration must be greater than zero".into()));
    }
    if input.size == Some(0) {
        return Err(LinkError::Config("payload size must be greater than zero".into()));
    }
    let port = match input.port {
        Some(0) => return Err(LinkError::Config("port must be non-zero".into())),
        Some(port) => port,
        None => ephemeral_port(),
    };
    let ms = |v: Option<u64>, d: Duration| v.map(Duration::from_millis).unwrap_or(d);

    Ok(TestConfig {
        mode,
        duration,
        size: input.size,
        port,
        warmup: ms(input.warmup_ms, defaults.warmup),
        settle: ms(input.settle_ms, defaults.settle),
        stop_grace: ms(input.stop_grace_ms, defaults.stop_grace),
        carrier_wait: ms(input.carrier_wait_ms, defaults.carrier_wait),
        json_output: input.json_output.unwrap_or(defaults.json_output),
    })
}

/// A random port from the IANA dynamic range.
pub fn ephemeral_port() -> u16 {
    rand::rng().random_range(EPHEMERAL_PORT_MIN..=u16::MAX)
}

/// Kernel rules for interface names: non-empty, at most 15 bytes, no `/`,
/// whitespace or `:`. We additionally restrict to a conservative charset and
/// refuse a leading `-` so a name can never be read as an option.
pub fn is_valid_interface_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= IFNAME_MAX
        && name != "."
        && name != ".."
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// `<number>[.<fraction>][K|M|G]`, as accepted by `iperf3 -b`.
pub fn is_valid_bitrate(rate: &str) -> bool {
    let digits = rate.trim_end_matches(['K', 'M', 'G', 'k', 'm', 'g']);
    if rate.len() - digits.len() > 1 || digits.is_empty() {
        return false;
    }
    let mut parts = digits.splitn(2, '.');
    let whole = parts.next().unwrap_or("");
    let frac = parts.next();
    !whole.is_empty()
        && whole.chars().all(|c| c.is_ascii_digit())
        && frac.map_or(true, |f| !f.is_empty() && f.chars().all(|c| c.is_ascii_digit()))
}

fn check_interface_pair(src_if: &str, dst_if: &str) -> Result<(), LinkError> {
    for name in [src_if, dst_if] {
        if !is_valid_interface_name(name) {
            return Err(LinkError::Config(format!("invalid interface name '{name}'")));
        }
    }
    if src_if == dst_if {
        return Err(LinkError::Config(format!(
            "source and destination must be different interfaces (both are '{src_if}')"
        )));
    }
    Ok(())
}

fn check_addr_pair(src: &IpNetwork, dst: &IpNetwork) -> Result<(), LinkError> {
    if src.is_ipv4() != dst.is_ipv4() {
        return Err(LinkError::Config(format!(
            "addresses {src} and {dst} are from different families"
        )));
    }
    if src.ip() == dst.ip() {
        return Err(LinkError::Config(format!("source and destination share address {}", src.ip())));
    }
    if !src.contains(dst.ip()) || !dst.contains(src.ip()) {
        return Err(LinkError::Config(format!("{src} and {dst} are not on the same subnet")));
    }
    Ok(())
}

fn parse_cidr(role: &str, text: &str) -> Result<IpNetwork, LinkError> {
    let text = text.trim();
    if !text.contains('/') {
        return Err(LinkError::Config(format!(
            "{role} address '{text}' needs a prefix length (e.g. 10.10.10.1/30)"
        )));
    }
    text.parse()
        .map_err(|e| LinkError::Config(format!("invalid {role} address '{text}': {e}")))
}

fn trimmed(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let t = v.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}
