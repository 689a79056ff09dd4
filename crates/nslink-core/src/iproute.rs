//! Real backend: drives the kernel through iproute2 and sysfs.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use ipnetwork::IpNetwork;
use serde::Deserialize;
use tracing::debug;

use crate::backend::{
    AddrInfo, AddrScope, CommandOutput, LinkInfo, ManagedProcess, NetBackend, OperState, Stat,
};
use crate::config::ToolPaths;
use crate::domain::Domain;

const LEDS_DIR: &str = "/sys/class/leds";

/// [`NetBackend`] over the `ip` tool.
#[derive(Debug, Clone)]
pub struct IpRoute2 {
    use_sudo: bool,
    tools: ToolPaths,
}

impl IpRoute2 {
    pub fn new(tools: ToolPaths, use_sudo: bool) -> Self {
        Self { use_sudo, tools }
    }

    fn command(&self, program: &str) -> Command {
        if self.use_sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg(program);
            cmd
        } else {
            Command::new(program)
        }
    }

    /// Run `[sudo] <program> <args>`, returning raw output.
    fn run(&self, program: &str, args: &[&str]) -> Result<Output> {
        debug!(program, args = %args.join(" "), sudo = self.use_sudo, "exec");
        self.command(program)
            .args(args)
            .output()
            .with_context(|| format!("{program} {}", args.join(" ")))
    }

    /// Run and bail with stderr on a non-zero exit.
    fn run_checked(&self, program: &str, args: &[&str]) -> Result<Output> {
        let output = self.run(program, args)?;
        if !output.status.success() {
            bail!(
                "command failed: {program} {}\n{}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output)
    }

    /// `ip [-n <ns>] <args>`, checked.
    fn ip(&self, domain: Domain<'_>, args: &[&str]) -> Result<Output> {
        let mut full = Vec::with_capacity(args.len() + 2);
        if let Some(ns) = domain.name() {
            full.push("-n");
            full.push(ns);
        }
        full.extend_from_slice(args);
        self.run_checked(&self.tools.ip, &full)
    }

    fn write_sysfs(&self, path: &Path, value: &str) -> Result<()> {
        if self.use_sudo {
            let path = path.to_string_lossy();
            self.run_checked("sh", &["-c", "printf %s \"$1\" > \"$2\"", "sh", value, &path])?;
            Ok(())
        } else {
            std::fs::write(path, value).with_context(|| format!("write {}", path.display()))
        }
    }

    fn blink_leds(&self, leds: &[PathBuf], duration: Duration) -> Result<()> {
        let mut saved = Vec::with_capacity(leds.len());
        for led in leds {
            let trigger = led.join("trigger");
            let current = std::fs::read_to_string(&trigger)
                .ok()
                .and_then(|s| active_trigger(&s))
                .unwrap_or_else(|| "none".to_string());
            self.write_sysfs(&trigger, "timer")?;
            saved.push((trigger, current));
        }
        std::thread::sleep(duration);
        for (trigger, previous) in saved {
            if let Err(e) = self.write_sysfs(&trigger, &previous) {
                debug!(path = %trigger.display(), error = %e, "failed to restore LED trigger");
            }
        }
        Ok(())
    }
}

impl NetBackend for IpRoute2 {
    fn link(&self, domain: Domain<'_>, iface: &str) -> Result<Option<LinkInfo>> {
        let mut args = Vec::new();
        if let Some(ns) = domain.name() {
            args.extend(["-n", ns]);
        }
        args.extend(["-j", "addr", "show", "dev", iface]);
        let output = self.run(&self.tools.ip, &args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("does not exist") || stderr.contains("Cannot find device") {
                return Ok(None);
            }
            bail!("ip {} failed: {}", args.join(" "), stderr.trim());
        }
        let links = parse_links(&String::from_utf8_lossy(&output.stdout))?;
        Ok(links.into_iter().find(|l| l.name == iface))
    }

    fn links(&self, domain: Domain<'_>) -> Result<Vec<LinkInfo>> {
        let output = self.ip(domain, &["-j", "addr", "show"])?;
        parse_links(&String::from_utf8_lossy(&output.stdout))
    }

    fn set_admin(&self, domain: Domain<'_>, iface: &str, up: bool) -> Result<()> {
        let state = if up { "up" } else { "down" };
        self.ip(domain, &["link", "set", "dev", iface, state])?;
        Ok(())
    }

    fn set_mtu(&self, domain: Domain<'_>, iface: &str, mtu: u32) -> Result<()> {
        let mtu = mtu.to_string();
        self.ip(domain, &["link", "set", "dev", iface, "mtu", &mtu])?;
        Ok(())
    }

    fn flush_addrs(&self, domain: Domain<'_>, iface: &str) -> Result<()> {
        self.ip(domain, &["addr", "flush", "dev", iface])?;
        Ok(())
    }

    fn add_addr(&self, domain: Domain<'_>, iface: &str, addr: &IpNetwork) -> Result<()> {
        let cidr = addr.to_string();
        self.ip(domain, &["addr", "add", &cidr, "dev", iface])?;
        Ok(())
    }

    fn move_link(&self, from: Domain<'_>, iface: &str, to: Domain<'_>) -> Result<()> {
        // PID 1 always lives in the default namespace.
        let target = to.name().unwrap_or("1");
        self.ip(from, &["link", "set", "dev", iface, "netns", target])?;
        Ok(())
    }

    fn domains(&self) -> Result<Vec<String>> {
        let output = self.run_checked(&self.tools.ip, &["netns", "list"])?;
        Ok(parse_netns_list(&String::from_utf8_lossy(&output.stdout)))
    }

    fn add_domain(&self, name: &str) -> Result<()> {
        self.run_checked(&self.tools.ip, &["netns", "add", name])
            .with_context(|| format!("create netns '{name}'"))?;
        Ok(())
    }

    fn del_domain(&self, name: &str) -> Result<()> {
        self.run_checked(&self.tools.ip, &["netns", "del", name])
            .with_context(|| format!("delete netns '{name}'"))?;
        Ok(())
    }

    fn read_stat(&self, domain: &str, iface: &str, stat: Stat) -> Result<u64> {
        let path = format!("/sys/class/net/{iface}/statistics/{}", stat.file_name());
        let output = self.run_checked(&self.tools.ip, &["netns", "exec", domain, "cat", &path])?;
        let text = String::from_utf8_lossy(&output.stdout);
        text.trim()
            .parse()
            .with_context(|| format!("parse {path}: {:?}", text.trim()))
    }

    fn exec(&self, domain: &str, program: &str, args: &[String]) -> Result<CommandOutput> {
        let full = netns_exec_args(domain, program, args);
        let output = self.run(&self.tools.ip, &full)?;
        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn spawn(
        &self,
        domain: &str,
        program: &str,
        args: &[String],
    ) -> Result<Box<dyn ManagedProcess>> {
        let full = netns_exec_args(domain, program, args);
        debug!(domain, program, args = %args.join(" "), "spawn");
        let child = self
            .command(&self.tools.ip)
            .args(&full)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn {program} in netns '{domain}'"))?;
        Ok(Box::new(ChildProcess {
            child,
            use_sudo: self.use_sudo,
            exited: None,
        }))
    }

    fn identify(&self, iface: &str, duration: Duration) -> Result<()> {
        let leds = leds_for(Path::new(LEDS_DIR), iface);
        if !leds.is_empty() {
            debug!(iface, count = leds.len(), "blinking sysfs LEDs");
            return self.blink_leds(&leds, duration);
        }
        let secs = duration.as_secs().max(1).to_string();
        self.run_checked(&self.tools.ethtool, &["--identify", iface, &secs])
            .with_context(|| format!("no LED under {LEDS_DIR} for {iface} and ethtool failed"))?;
        Ok(())
    }
}

/// A child started through `ip netns exec`.
struct ChildProcess {
    child: Child,
    use_sudo: bool,
    exited: Option<Option<i32>>,
}

impl ChildProcess {
    fn signal(&self, signal: i32) {
        let pid = self.child.id();
        if self.use_sudo {
            // The child is root-owned; an unprivileged kill(2) would get EPERM.
            let _ = Command::new("sudo")
                .args(["kill", &format!("-{signal}"), &pid.to_string()])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            return;
        }
        // SAFETY: `pid` is our own child which has not been reaped yet
        // (`exited` is None), so the PID cannot have been recycled.
        unsafe {
            libc::kill(pid as libc::pid_t, signal);
        }
    }

    fn poll(&mut self) -> Option<Option<i32>> {
        if self.exited.is_none() {
            if let Ok(Some(status)) = self.child.try_wait() {
                self.exited = Some(status.code());
            }
        }
        self.exited
    }
}

impl ManagedProcess for ChildProcess {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn is_running(&mut self) -> bool {
        self.poll().is_none()
    }

    fn failure_output(&mut self) -> String {
        let mut buf = String::new();
        if let Some(mut stderr) = self.child.stderr.take() {
            let _ = stderr.read_to_string(&mut buf);
        }
        buf.trim().to_string()
    }

    fn terminate(&mut self, grace: Duration) -> Result<Option<i32>> {
        if let Some(code) = self.poll() {
            return Ok(code);
        }
        self.signal(libc::SIGTERM);
        match wait_with_timeout(&mut self.child, grace) {
            Ok(code) => {
                self.exited = Some(code);
                Ok(code)
            }
            Err(_) => {
                debug!(pid = self.child.id(), "responder ignored SIGTERM, killing");
                self.signal(libc::SIGKILL);
                let status = self.child.wait().context("reap responder")?;
                self.exited = Some(status.code());
                Ok(status.code())
            }
        }
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if self.poll().is_none() {
            self.signal(libc::SIGKILL);
            let _ = self.child.wait();
        }
    }
}

fn netns_exec_args<'a>(domain: &'a str, program: &'a str, args: &'a [String]) -> Vec<&'a str> {
    let mut full = vec!["netns", "exec", domain, program];
    full.extend(args.iter().map(String::as_str));
    full
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Result<Option<i32>> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait()? {
            Some(status) => return Ok(status.code()),
            None => {
                if Instant::now() >= deadline {
                    bail!("timeout waiting for child process");
                }
                std::thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

// -- ip -j parsing --

#[derive(Debug, Deserialize)]
struct JsonLink {
    ifname: String,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    mtu: u32,
    #[serde(default)]
    operstate: Option<String>,
    #[serde(default)]
    link_type: Option<String>,
    #[serde(default)]
    addr_info: Vec<JsonAddr>,
}

#[derive(Debug, Deserialize)]
struct JsonAddr {
    #[serde(default)]
    local: Option<String>,
    #[serde(default)]
    prefixlen: Option<u8>,
    #[serde(default)]
    scope: Option<String>,
}

impl From<JsonLink> for LinkInfo {
    fn from(raw: JsonLink) -> Self {
        let has = |flag: &str| raw.flags.iter().any(|f| f == flag);
        let admin_up = has("UP");
        let carrier = if !admin_up {
            None
        } else if has("NO-CARRIER") {
            Some(false)
        } else if has("LOWER_UP") {
            Some(true)
        } else {
            None
        };
        let addrs = raw
            .addr_info
            .iter()
            .filter_map(|a| {
                let network = format!("{}/{}", a.local.as_deref()?, a.prefixlen?)
                    .parse()
                    .ok()?;
                Some(AddrInfo {
                    network,
                    scope: AddrScope::parse(a.scope.as_deref().unwrap_or("global")),
                })
            })
            .collect();
        LinkInfo {
            oper_state: OperState::parse(raw.operstate.as_deref().unwrap_or("UNKNOWN")),
            link_type: raw.link_type.unwrap_or_else(|| "ether".into()),
            name: raw.ifname,
            admin_up,
            carrier,
            mtu: raw.mtu,
            addrs,
        }
    }
}

/// Parse the output of `ip -j addr show`.
pub(crate) fn parse_links(json: &str) -> Result<Vec<LinkInfo>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let raw: Vec<JsonLink> = serde_json::from_str(json).context("parse `ip -j addr` output")?;
    Ok(raw.into_iter().map(LinkInfo::from).collect())
}

/// `ip netns list` prints `name (id: N)` or just `name`, one per line.
pub(crate) fn parse_netns_list(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|l| l.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// LED class devices with `iface` as one `:`-separated name component
/// (e.g. `enp3s0:green:link`). `eth1` does not match `eth10:green:link`.
pub(crate) fn leds_for(dir: &Path, iface: &str) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut leds: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().split(':').any(|part| part == iface))
        .map(|e| e.path())
        .collect();
    leds.sort();
    leds
}

/// The bracketed entry of a sysfs `trigger` file: `none [timer] heartbeat`.
fn active_trigger(contents: &str) -> Option<String> {
    contents
        .split_whitespace()
        .find(|t| t.starts_with('[') && t.ends_with(']'))
        .map(|t| t.trim_matches(|c| c == '[' || c == ']').to_string())
}
