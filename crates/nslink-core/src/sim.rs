//! In-memory kernel model implementing [`NetBackend`].
//!
//! Models the parts of Linux networking the tester touches: a default
//! domain plus named namespaces, interfaces that live in exactly one of
//! them, cables between interface pairs, per-interface counters, and the
//! benchmark tools (`iperf3` client/server, `ping -f`). Moving an
//! interface resets it to down and address-free, and deleting a namespace
//! returns physical interfaces to the default domain while destroying
//! veth devices, as the kernel does.
//!
//! Cloning a `SimNet` yields a handle onto the same state, so a test can
//! keep one handle for inspection while a session owns another.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use ipnetwork::IpNetwork;

use crate::backend::{
    AddrInfo, AddrScope, CommandOutput, LinkInfo, ManagedProcess, NetBackend, OperState, Stat,
};
use crate::domain::Domain;
use crate::session::CancelFlag;

/// Packets per second the emulated tools push across a healthy link.
const PACKETS_PER_SEC: u64 = 1000;
const SIM_JITTER_MS: f64 = 0.042;
const FIRST_PID: u32 = 40_000;

/// Operations that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SimOp {
    Links,
    SetAdmin,
    SetMtu,
    FlushAddrs,
    AddAddr,
    MoveLink,
    AddDomain,
    DelDomain,
    ReadStat,
    Exec,
    Spawn,
    Identify,
}

#[derive(Debug, Clone)]
struct Fault {
    op: SimOp,
    /// Interface or namespace name the fault is limited to.
    target: Option<String>,
    persistent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IfaceKind {
    Physical,
    Veth,
}

#[derive(Debug, Clone)]
struct SimIface {
    /// `None` is the default domain.
    domain: Option<String>,
    kind: IfaceKind,
    admin_up: bool,
    oper_unknown: bool,
    mtu: u32,
    addrs: Vec<AddrInfo>,
    tx_packets: u64,
    rx_packets: u64,
    crc_errors: u64,
}

impl SimIface {
    fn new(kind: IfaceKind) -> Self {
        Self {
            domain: None,
            kind,
            admin_up: false,
            oper_unknown: false,
            mtu: 1500,
            addrs: Vec::new(),
            tx_packets: 0,
            rx_packets: 0,
            crc_errors: 0,
        }
    }

    fn in_domain(&self, domain: Domain<'_>) -> bool {
        self.domain.as_deref() == domain.name()
    }

    /// What the kernel does to a device entering a new namespace.
    fn reset_for_move(&mut self) {
        self.admin_up = false;
        self.addrs.clear();
    }
}

#[derive(Debug, Clone)]
struct SimResponder {
    domain: String,
    port: u16,
    alive: bool,
    output: String,
}

#[derive(Debug, Default)]
struct SimState {
    /// Named namespaces and whether their loopback is up.
    domains: BTreeMap<String, bool>,
    ifaces: BTreeMap<String, SimIface>,
    cables: BTreeMap<String, String>,
    cut: BTreeSet<String>,
    responders: BTreeMap<u32, SimResponder>,
    next_pid: u32,
    faults: Vec<Fault>,
    loss_percent: f64,
    crash_responders: bool,
    /// Raised when the next benchmark client runs, as Ctrl-C would.
    interrupt_client: Option<CancelFlag>,
    paused: Duration,
    ops: Vec<String>,
}

impl SimState {
    fn take_fault(&mut self, op: SimOp, target: &str) -> Result<()> {
        let hit = self.faults.iter().position(|f| {
            f.op == op && f.target.as_deref().map_or(true, |t| t == target)
        });
        if let Some(idx) = hit {
            if !self.faults[idx].persistent {
                self.faults.remove(idx);
            }
            bail!("simulated failure: {op:?} on '{target}'");
        }
        Ok(())
    }

    fn require_domain(&self, domain: Domain<'_>) -> Result<()> {
        match domain {
            Domain::Root => Ok(()),
            Domain::Named(ns) if self.domains.contains_key(ns) => Ok(()),
            Domain::Named(ns) => bail!("Cannot open network namespace \"{ns}\": No such file or directory"),
        }
    }

    fn iface_mut(&mut self, domain: Domain<'_>, name: &str) -> Result<&mut SimIface> {
        self.require_domain(domain)?;
        match self.ifaces.get_mut(name) {
            Some(iface) if iface.in_domain(domain) => Ok(iface),
            _ => bail!("Cannot find device \"{name}\""),
        }
    }

    fn peer_of(&self, name: &str) -> Option<&str> {
        if self.cut.contains(name) {
            return None;
        }
        self.cables.get(name).map(String::as_str)
    }

    fn carrier(&self, name: &str) -> Option<bool> {
        let iface = self.ifaces.get(name)?;
        if !iface.admin_up {
            return None;
        }
        let peer_up = self
            .peer_of(name)
            .and_then(|p| self.ifaces.get(p))
            .is_some_and(|p| p.admin_up);
        Some(peer_up)
    }

    fn link_info(&self, name: &str, iface: &SimIface) -> LinkInfo {
        let carrier = self.carrier(name);
        let oper_state = match (iface.admin_up, carrier) {
            (true, _) if iface.oper_unknown => OperState::Unknown,
            (true, Some(true)) => OperState::Up,
            _ => OperState::Down,
        };
        LinkInfo {
            name: name.to_string(),
            admin_up: iface.admin_up,
            oper_state,
            carrier,
            mtu: iface.mtu,
            link_type: "ether".into(),
            addrs: iface.addrs.clone(),
        }
    }

    fn loopback(&self, domain: Domain<'_>) -> LinkInfo {
        let up = match domain {
            Domain::Root => true,
            Domain::Named(ns) => self.domains.get(ns).copied().unwrap_or(false),
        };
        let addrs = "127.0.0.1/8"
            .parse::<IpNetwork>()
            .ok()
            .filter(|_| up)
            .map(|network| AddrInfo {
                network,
                scope: AddrScope::Host,
            })
            .into_iter()
            .collect();
        LinkInfo {
            name: "lo".into(),
            admin_up: up,
            oper_state: OperState::Unknown,
            carrier: if up { Some(true) } else { None },
            mtu: 65536,
            link_type: "loopback".into(),
            addrs,
        }
    }

    /// The interface in `domain` owning `addr`, reached over a live cable
    /// from an up interface in `from` that shares its subnet.
    fn route(&self, from: &str, addr: &str) -> Option<(String, String)> {
        let target: std::net::IpAddr = addr.parse().ok()?;
        self.ifaces
            .iter()
            .filter(|(_, i)| i.domain.as_deref() == Some(from) && i.admin_up)
            .filter(|(_, i)| i.addrs.iter().any(|a| a.network.contains(target)))
            .find_map(|(name, _)| {
                let peer = self.peer_of(name)?;
                let p = self.ifaces.get(peer)?;
                let owns = p.admin_up && p.addrs.iter().any(|a| a.network.ip() == target);
                owns.then(|| (name.clone(), peer.to_string()))
            })
    }

    fn delivered(&self, sent: u64) -> u64 {
        let lost = (sent as f64 * self.loss_percent / 100.0).round() as u64;
        sent.saturating_sub(lost)
    }
}

/// Simulated host. See the module docs.
#[derive(Debug, Clone, Default)]
pub struct SimNet {
    state: Arc<Mutex<SimState>>,
}

impl SimNet {
    pub fn new() -> Self {
        let sim = Self::default();
        sim.state().next_pid = FIRST_PID;
        sim
    }

    /// The host offered by `nslink --simulate`: `sim0`/`sim1` down and
    /// cabled to each other (ready for explicit use), `sim2`/`sim3` up and
    /// cabled (auto-selection candidates).
    pub fn simulated_host() -> Self {
        let sim = Self::new();
        sim.add_cabled_pair("sim0", "sim1");
        sim.add_cabled_pair("sim2", "sim3");
        sim.set_admin_state("sim2", true);
        sim.set_admin_state("sim3", true);
        sim
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -- host setup --

    /// A physical interface in the default domain: down, no address, no cable.
    pub fn add_interface(&self, name: &str) {
        self.state()
            .ifaces
            .insert(name.to_string(), SimIface::new(IfaceKind::Physical));
    }

    /// Two physical interfaces joined by a cable.
    pub fn add_cabled_pair(&self, a: &str, b: &str) {
        self.add_interface(a);
        self.add_interface(b);
        let mut st = self.state();
        st.cables.insert(a.to_string(), b.to_string());
        st.cables.insert(b.to_string(), a.to_string());
    }

    /// A veth pair: destroyed, not returned, when its namespace is deleted.
    pub fn add_veth_pair(&self, a: &str, b: &str) {
        let mut st = self.state();
        st.ifaces.insert(a.to_string(), SimIface::new(IfaceKind::Veth));
        st.ifaces.insert(b.to_string(), SimIface::new(IfaceKind::Veth));
        st.cables.insert(a.to_string(), b.to_string());
        st.cables.insert(b.to_string(), a.to_string());
    }

    /// Operator action outside the tester, wherever the interface lives.
    pub fn set_admin_state(&self, name: &str, up: bool) {
        if let Some(iface) = self.state().ifaces.get_mut(name) {
            iface.admin_up = up;
        }
    }

    /// Assign an address from outside the tester.
    pub fn assign_address(&self, name: &str, cidr: &str) {
        let Ok(network) = cidr.parse() else { return };
        if let Some(iface) = self.state().ifaces.get_mut(name) {
            iface.addrs.push(AddrInfo {
                network,
                scope: AddrScope::Global,
            });
        }
    }

    /// Make the driver report `operstate UNKNOWN` while up.
    pub fn set_oper_unknown(&self, name: &str, unknown: bool) {
        if let Some(iface) = self.state().ifaces.get_mut(name) {
            iface.oper_unknown = unknown;
        }
    }

    /// Unplug (or replug) the cable at `name`.
    pub fn set_cable_cut(&self, name: &str, cut: bool) {
        let mut st = self.state();
        let peer = st.cables.get(name).cloned();
        for end in std::iter::once(name.to_string()).chain(peer) {
            if cut {
                st.cut.insert(end);
            } else {
                st.cut.remove(&end);
            }
        }
    }

    /// Percentage of packets dropped on every cable.
    pub fn set_loss_percent(&self, percent: f64) {
        self.state().loss_percent = percent.clamp(0.0, 100.0);
    }

    /// Spawned responders exit immediately as if their port were taken.
    pub fn set_crash_responders(&self, crash: bool) {
        self.state().crash_responders = crash;
    }

    /// The next client run is cut short by an interrupt that also raises
    /// `cancel`.
    pub fn interrupt_next_client(&self, cancel: &CancelFlag) {
        self.state().interrupt_client = Some(cancel.clone());
    }

    pub fn bump_counters(&self, name: &str, tx: u64, rx: u64) {
        if let Some(iface) = self.state().ifaces.get_mut(name) {
            iface.tx_packets += tx;
            iface.rx_packets += rx;
        }
    }

    pub fn inject_crc_errors(&self, name: &str, count: u64) {
        if let Some(iface) = self.state().ifaces.get_mut(name) {
            iface.crc_errors += count;
        }
    }

    /// Fail the next `op` (on `target`, if given).
    pub fn fail_once(&self, op: SimOp, target: Option<&str>) {
        self.state().faults.push(Fault {
            op,
            target: target.map(str::to_string),
            persistent: false,
        });
    }

    /// Fail every `op` (on `target`, if given) until [`SimNet::clear_faults`].
    pub fn fail_always(&self, op: SimOp, target: Option<&str>) {
        self.state().faults.push(Fault {
            op,
            target: target.map(str::to_string),
            persistent: true,
        });
    }

    pub fn clear_faults(&self) {
        self.state().faults.clear();
    }

    // -- inspection --

    /// Domain currently holding `name`: `Some(None)` for the default domain,
    /// `None` if the interface no longer exists.
    pub fn location(&self, name: &str) -> Option<Option<String>> {
        self.state().ifaces.get(name).map(|i| i.domain.clone())
    }

    pub fn exists(&self, name: &str) -> bool {
        self.state().ifaces.contains_key(name)
    }

    pub fn domain_names(&self) -> Vec<String> {
        self.state().domains.keys().cloned().collect()
    }

    /// Responders still running.
    pub fn live_responders(&self) -> Vec<u32> {
        self.state()
            .responders
            .iter()
            .filter(|(_, r)| r.alive)
            .map(|(pid, _)| *pid)
            .collect()
    }

    /// Total simulated sleep requested through [`NetBackend::pause`].
    pub fn paused(&self) -> Duration {
        self.state().paused
    }

    /// Mutating operations in the order they happened.
    pub fn ops(&self) -> Vec<String> {
        self.state().ops.clone()
    }

    // -- tool emulation --

    fn run_iperf3_client(st: &mut SimState, domain: &str, args: &[String]) -> CommandOutput {
        let target = flag_value(args, "-c").unwrap_or_default();
        let port: u16 = flag_value(args, "-p").and_then(|p| p.parse().ok()).unwrap_or(5201);
        let secs: u64 = flag_value(args, "-t").and_then(|t| t.parse().ok()).unwrap_or(10);
        let udp = args.iter().any(|a| a == "-u");
        let json = args.iter().any(|a| a == "-J");

        let Some((src, dst)) = st.route(domain, &target) else {
            return fail_output(json, "unable to connect to server: No route to host");
        };
        let dst_domain = st.ifaces.get(&dst).and_then(|i| i.domain.clone());
        let listening = st
            .responders
            .values()
            .any(|r| r.alive && r.port == port && Some(&r.domain) == dst_domain.as_ref());
        if !listening {
            return fail_output(json, "unable to connect to server: Connection refused");
        }

        let sent = secs * PACKETS_PER_SEC;
        let received = st.delivered(sent);
        let acks = if udp { 0 } else { received / 2 };
        if let Some(i) = st.ifaces.get_mut(&src) {
            i.tx_packets += sent;
            i.rx_packets += acks;
        }
        if let Some(i) = st.ifaces.get_mut(&dst) {
            i.rx_packets += received;
            i.tx_packets += acks;
        }
        st.ops.push(format!("iperf3 client {domain} -> {target}:{port}"));

        let lost = sent - received;
        let lost_percent = lost as f64 * 100.0 / sent as f64;
        let bytes = received * 1448;
        let bps = bytes as f64 * 8.0 / secs as f64;
        let stdout = match (json, udp) {
            (true, true) => serde_json::json!({
                "start": {"connected": [{"remote_host": target, "remote_port": port}]},
                "end": {"sum": {
                    "seconds": secs as f64, "bytes": bytes, "bits_per_second": bps,
                    "jitter_ms": SIM_JITTER_MS, "lost_packets": lost, "packets": sent,
                    "lost_percent": lost_percent
                }}
            })
            .to_string(),
            (true, false) => serde_json::json!({
                "start": {"connected": [{"remote_host": target, "remote_port": port}]},
                "end": {
                    "sum_sent": {"seconds": secs as f64, "bytes": bytes, "bits_per_second": bps, "retransmits": 0},
                    "sum_received": {"seconds": secs as f64, "bytes": bytes, "bits_per_second": bps}
                }
            })
            .to_string(),
            (false, true) => format!(
                "Connecting to host {target}, port {port}\n\
                 [ ID] Interval           Transfer     Bitrate         Jitter    Lost/Total Datagrams\n\
                 [  5]   0.00-{secs}.00  sec  {mb:.2} MBytes  {mbps:.2} Mbits/sec  0.000 ms  0/{sent} (0%)  sender\n\
                 [  5]   0.00-{secs}.00  sec  {mb:.2} MBytes  {mbps:.2} Mbits/sec  {SIM_JITTER_MS:.3} ms  {lost}/{sent} ({lost_percent:.2}%)  receiver\n\n\
                 iperf Done.\n",
                mb = bytes as f64 / 1_048_576.0,
                mbps = bps / 1_000_000.0,
            ),
            (false, false) => format!(
                "Connecting to host {target}, port {port}\n\
                 [ ID] Interval           Transfer     Bitrate         Retr\n\
                 [  5]   0.00-{secs}.00  sec  {mb:.2} MBytes  {mbps:.2} Mbits/sec    0             sender\n\
                 [  5]   0.00-{secs}.00  sec  {mb:.2} MBytes  {mbps:.2} Mbits/sec                  receiver\n\n\
                 iperf Done.\n",
                mb = bytes as f64 / 1_048_576.0,
                mbps = bps / 1_000_000.0,
            ),
        };
        CommandOutput {
            status: Some(0),
            stdout,
            stderr: String::new(),
        }
    }

    fn run_ping_flood(st: &mut SimState, domain: &str, args: &[String]) -> CommandOutput {
        let target = args.last().cloned().unwrap_or_default();
        let secs: u64 = flag_value(args, "-w").and_then(|w| w.parse().ok()).unwrap_or(1);
        let sent = secs * PACKETS_PER_SEC;
        let (received, route) = match st.route(domain, &target) {
            Some((src, dst)) => (st.delivered(sent), Some((src, dst))),
            None => (0, None),
        };
        if let Some((src, dst)) = route {
            if let Some(i) = st.ifaces.get_mut(&src) {
                i.tx_packets += sent;
                i.rx_packets += received;
            }
            if let Some(i) = st.ifaces.get_mut(&dst) {
                i.rx_packets += received;
                i.tx_packets += received;
            }
        }
        st.ops.push(format!("ping flood {domain} -> {target}"));
        let loss = (sent - received) as f64 * 100.0 / sent as f64;
        CommandOutput {
            // ping exits 1 when any reply is missing.
            status: Some(if received == sent { 0 } else { 1 }),
            stdout: format!(
                "PING {target} ({target}) 56(84) bytes of data.\n\n\
                 --- {target} ping statistics ---\n\
                 {sent} packets transmitted, {received} received, {loss:.0}% packet loss, time {ms}ms\n",
                ms = secs * 1000,
            ),
            stderr: String::new(),
        }
    }
}

fn flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn fail_output(json: bool, message: &str) -> CommandOutput {
    if json {
        CommandOutput {
            status: Some(1),
            stdout: serde_json::json!({"start": {}, "end": {}, "error": message}).to_string(),
            stderr: String::new(),
        }
    } else {
        CommandOutput {
            status: Some(1),
            stdout: String::new(),
            stderr: format!("iperf3: error - {message}\n"),
        }
    }
}

fn program_is(program: &str, tool: &str) -> bool {
    program.rsplit('/').next() == Some(tool)
}

impl NetBackend for SimNet {
    fn link(&self, domain: Domain<'_>, iface: &str) -> Result<Option<LinkInfo>> {
        let st = self.state();
        st.require_domain(domain)?;
        if iface == "lo" {
            return Ok(Some(st.loopback(domain)));
        }
        Ok(st
            .ifaces
            .get(iface)
            .filter(|i| i.in_domain(domain))
            .map(|i| st.link_info(iface, i)))
    }

    fn links(&self, domain: Domain<'_>) -> Result<Vec<LinkInfo>> {
        let mut st = self.state();
        st.take_fault(SimOp::Links, &domain.to_string())?;
        st.require_domain(domain)?;
        let mut out = vec![st.loopback(domain)];
        out.extend(
            st.ifaces
                .iter()
                .filter(|(_, i)| i.in_domain(domain))
                .map(|(name, i)| st.link_info(name, i)),
        );
        Ok(out)
    }

    fn set_admin(&self, domain: Domain<'_>, iface: &str, up: bool) -> Result<()> {
        let mut st = self.state();
        st.take_fault(SimOp::SetAdmin, iface)?;
        if iface == "lo" {
            if let Domain::Named(ns) = domain {
                st.require_domain(domain)?;
                st.domains.insert(ns.to_string(), up);
                st.ops.push(format!("lo {} in {ns}", if up { "up" } else { "down" }));
            }
            return Ok(());
        }
        let dev = st.iface_mut(domain, iface)?;
        dev.admin_up = up;
        let ll = AddrInfo {
            network: "fe80::1/64".parse::<IpNetwork>().map_err(|e| anyhow!("{e}"))?,
            scope: AddrScope::Link,
        };
        if up {
            if !dev.addrs.iter().any(|a| a.scope == AddrScope::Link) {
                dev.addrs.push(ll);
            }
        } else {
            // Kernel drops IPv6 link-local on down.
            dev.addrs.retain(|a| a.scope != AddrScope::Link);
        }
        st.ops.push(format!("{iface} {} in {domain}", if up { "up" } else { "down" }));
        Ok(())
    }

    fn set_mtu(&self, domain: Domain<'_>, iface: &str, mtu: u32) -> Result<()> {
        let mut st = self.state();
        st.take_fault(SimOp::SetMtu, iface)?;
        let dev = st.iface_mut(domain, iface)?;
        if !(68..=65535).contains(&mtu) {
            bail!("Error: mtu less than device minimum.");
        }
        dev.mtu = mtu;
        st.ops.push(format!("{iface} mtu {mtu} in {domain}"));
        Ok(())
    }

    fn flush_addrs(&self, domain: Domain<'_>, iface: &str) -> Result<()> {
        let mut st = self.state();
        st.take_fault(SimOp::FlushAddrs, iface)?;
        st.iface_mut(domain, iface)?.addrs.clear();
        st.ops.push(format!("{iface} flush in {domain}"));
        Ok(())
    }

    fn add_addr(&self, domain: Domain<'_>, iface: &str, addr: &IpNetwork) -> Result<()> {
        let mut st = self.state();
        st.take_fault(SimOp::AddAddr, iface)?;
        let dev = st.iface_mut(domain, iface)?;
        if dev.addrs.iter().any(|a| a.network.ip() == addr.ip()) {
            bail!("RTNETLINK answers: File exists");
        }
        dev.addrs.push(AddrInfo {
            network: *addr,
            scope: AddrScope::Global,
        });
        st.ops.push(format!("{iface} addr {addr} in {domain}"));
        Ok(())
    }

    fn move_link(&self, from: Domain<'_>, iface: &str, to: Domain<'_>) -> Result<()> {
        let mut st = self.state();
        st.take_fault(SimOp::MoveLink, iface)?;
        st.require_domain(to)?;
        let dev = st.iface_mut(from, iface)?;
        dev.reset_for_move();
        dev.domain = to.name().map(str::to_string);
        st.ops.push(format!("move {iface} {from} -> {to}"));
        Ok(())
    }

    fn domains(&self) -> Result<Vec<String>> {
        Ok(self.domain_names())
    }

    fn add_domain(&self, name: &str) -> Result<()> {
        let mut st = self.state();
        st.take_fault(SimOp::AddDomain, name)?;
        if st.domains.contains_key(name) {
            bail!("Cannot create namespace file \"/run/netns/{name}\": File exists");
        }
        st.domains.insert(name.to_string(), false);
        st.ops.push(format!("add netns {name}"));
        Ok(())
    }

    fn del_domain(&self, name: &str) -> Result<()> {
        let mut st = self.state();
        st.take_fault(SimOp::DelDomain, name)?;
        if st.domains.remove(name).is_none() {
            bail!("Cannot remove namespace file \"/run/netns/{name}\": No such file or directory");
        }
        let members: Vec<(String, IfaceKind)> = st
            .ifaces
            .iter()
            .filter(|(_, i)| i.domain.as_deref() == Some(name))
            .map(|(n, i)| (n.clone(), i.kind))
            .collect();
        for (dev, kind) in members {
            match kind {
                IfaceKind::Physical => {
                    if let Some(i) = st.ifaces.get_mut(&dev) {
                        i.reset_for_move();
                        i.domain = None;
                    }
                }
                IfaceKind::Veth => {
                    let peer = st.cables.remove(&dev);
                    st.ifaces.remove(&dev);
                    if let Some(peer) = peer {
                        st.cables.remove(&peer);
                        st.ifaces.remove(&peer);
                    }
                }
            }
        }
        for r in st.responders.values_mut().filter(|r| r.domain == name) {
            r.alive = false;
        }
        st.ops.push(format!("del netns {name}"));
        Ok(())
    }

    fn read_stat(&self, domain: &str, iface: &str, stat: Stat) -> Result<u64> {
        let mut st = self.state();
        st.take_fault(SimOp::ReadStat, iface)?;
        let dev = st.iface_mut(Domain::Named(domain), iface)?;
        Ok(match stat {
            Stat::TxPackets => dev.tx_packets,
            Stat::RxPackets => dev.rx_packets,
            Stat::RxCrcErrors => dev.crc_errors,
        })
    }

    fn exec(&self, domain: &str, program: &str, args: &[String]) -> Result<CommandOutput> {
        let mut st = self.state();
        st.take_fault(SimOp::Exec, program)?;
        st.require_domain(Domain::Named(domain))?;
        if let Some(cancel) = st.interrupt_client.take() {
            cancel.cancel();
            st.ops.push(format!("{program} client interrupted"));
            return Ok(CommandOutput {
                status: None,
                stdout: String::new(),
                stderr: format!("{program}: interrupt - the client has terminated\n"),
            });
        }
        if program_is(program, "iperf3") && args.iter().any(|a| a == "-c") {
            return Ok(Self::run_iperf3_client(&mut st, domain, args));
        }
        if program_is(program, "ping") {
            return Ok(Self::run_ping_flood(&mut st, domain, args));
        }
        Ok(CommandOutput {
            status: Some(127),
            stdout: String::new(),
            stderr: format!("exec of \"{program}\" failed: No such file or directory\n"),
        })
    }

    fn spawn(
        &self,
        domain: &str,
        program: &str,
        args: &[String],
    ) -> Result<Box<dyn ManagedProcess>> {
        let mut st = self.state();
        st.take_fault(SimOp::Spawn, program)?;
        st.require_domain(Domain::Named(domain))?;
        let pid = st.next_pid;
        st.next_pid += 1;

        let port: u16 = flag_value(args, "-p").and_then(|p| p.parse().ok()).unwrap_or(5201);
        let port_taken = st
            .responders
            .values()
            .any(|r| r.alive && r.domain == domain && r.port == port);
        let (alive, output) = if !program_is(program, "iperf3") {
            (false, format!("exec of \"{program}\" failed: No such file or directory"))
        } else if st.crash_responders || port_taken {
            (
                false,
                "iperf3: error - unable to start listener for connections: Address already in use"
                    .to_string(),
            )
        } else {
            (true, String::new())
        };
        st.responders.insert(
            pid,
            SimResponder {
                domain: domain.to_string(),
                port,
                alive,
                output,
            },
        );
        st.ops.push(format!("spawn {program} pid {pid} in {domain}"));
        Ok(Box::new(SimProcess {
            pid,
            state: Arc::clone(&self.state),
        }))
    }

    fn identify(&self, iface: &str, duration: Duration) -> Result<()> {
        let mut st = self.state();
        st.take_fault(SimOp::Identify, iface)?;
        if !st.ifaces.contains_key(iface) {
            bail!("no LED for {iface}");
        }
        st.paused += duration;
        st.ops.push(format!("identify {iface} {}s", duration.as_secs()));
        Ok(())
    }

    fn pause(&self, duration: Duration) {
        self.state().paused += duration;
    }
}

/// Handle on a simulated responder.
struct SimProcess {
    pid: u32,
    state: Arc<Mutex<SimState>>,
}

impl SimProcess {
    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ManagedProcess for SimProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_running(&mut self) -> bool {
        self.state()
            .responders
            .get(&self.pid)
            .is_some_and(|r| r.alive)
    }

    fn failure_output(&mut self) -> String {
        self.state()
            .responders
            .get(&self.pid)
            .map(|r| r.output.clone())
            .unwrap_or_default()
    }

    fn terminate(&mut self, _grace: Duration) -> Result<Option<i32>> {
        let mut st = self.state();
        let pid = self.pid;
        let was_alive = match st.responders.get_mut(&pid) {
            Some(r) => std::mem::replace(&mut r.alive, false),
            None => bail!("no such process {pid}"),
        };
        st.ops.push(format!("terminate pid {pid}"));
        Ok(Some(if was_alive { 0 } else { 1 }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn moving_resets_state_and_hides_from_root() {
        let sim = SimNet::new();
        sim.add_cabled_pair("eth1", "eth2");
        sim.set_admin_state("eth1", true);
        sim.assign_address("eth1", "192.168.1.1/24");
        sim.add_domain("ns1").unwrap();
        sim.move_link(Domain::Root, "eth1", Domain::Named("ns1")).unwrap();

        assert!(sim.link(Domain::Root, "eth1").unwrap().is_none());
        let inside = sim.link(Domain::Named("ns1"), "eth1").unwrap().unwrap();
        assert!(!inside.admin_up);
        assert!(inside.addrs.is_empty());
        assert_eq!(sim.location("eth1"), Some(Some("ns1".into())));
    }

    #[test]
    fn deleting_namespace_returns_physical_and_destroys_veth() {
        let sim = SimNet::new();
        sim.add_interface("eth1");
        sim.add_veth_pair("va", "vb");
        sim.add_domain("ns1").unwrap();
        sim.move_link(Domain::Root, "eth1", Domain::Named("ns1")).unwrap();
        sim.move_link(Domain::Root, "va", Domain::Named("ns1")).unwrap();
        sim.del_domain("ns1").unwrap();

        assert_eq!(sim.location("eth1"), Some(None));
        assert!(!sim.exists("va"));
        assert!(!sim.exists("vb"));
        assert!(sim.del_domain("ns1").is_err());
    }

    #[test]
    fn carrier_follows_cable_and_peer() {
        let sim = SimNet::new();
        sim.add_cabled_pair("a", "b");
        assert_eq!(sim.link(Domain::Root, "a").unwrap().unwrap().carrier, None);
        sim.set_admin_state("a", true);
        assert_eq!(sim.link(Domain::Root, "a").unwrap().unwrap().carrier, Some(false));
        sim.set_admin_state("b", true);
        assert_eq!(sim.link(Domain::Root, "a").unwrap().unwrap().carrier, Some(true));
        sim.set_cable_cut("b", true);
        assert_eq!(sim.link(Domain::Root, "a").unwrap().unwrap().carrier, Some(false));
    }

    #[test]
    fn up_adds_and_down_drops_link_local() {
        let sim = SimNet::new();
        sim.add_interface("a");
        sim.set_admin(Domain::Root, "a", true).unwrap();
        let info = sim.link(Domain::Root, "a").unwrap().unwrap();
        assert_eq!(info.addrs.len(), 1);
        assert!(!info.has_assigned_addr());
        sim.set_admin(Domain::Root, "a", false).unwrap();
        assert!(sim.link(Domain::Root, "a").unwrap().unwrap().addrs.is_empty());
    }

    fn wired(sim: &SimNet) {
        sim.add_cabled_pair("a", "b");
        for (ns, dev, cidr) in [("s", "a", "10.0.0.1/30"), ("d", "b", "10.0.0.2/30")] {
            sim.add_domain(ns).unwrap();
            sim.move_link(Domain::Root, dev, Domain::Named(ns)).unwrap();
            sim.set_admin(Domain::Named(ns), dev, true).unwrap();
            sim.add_addr(Domain::Named(ns), dev, &cidr.parse().unwrap()).unwrap();
        }
    }

    #[test]
    fn iperf_needs_a_listening_responder() {
        let sim = SimNet::new();
        wired(&sim);
        let client = args(&["-c", "10.0.0.2", "-p", "5201", "-t", "2", "-J"]);
        let refused = sim.exec("s", "iperf3", &client).unwrap();
        assert_eq!(refused.status, Some(1));
        assert!(refused.stdout.contains("Connection refused"));

        let mut server = sim.spawn("d", "iperf3", &args(&["-s", "-p", "5201"])).unwrap();
        assert!(server.is_running());
        let ok = sim.exec("s", "iperf3", &client).unwrap();
        assert!(ok.success());
        assert!(ok.stdout.contains("sum_sent"));
        assert_eq!(sim.read_stat("s", "a", Stat::TxPackets).unwrap(), 2000);
        assert_eq!(sim.read_stat("d", "b", Stat::RxPackets).unwrap(), 2000);

        assert_eq!(server.terminate(Duration::from_secs(1)).unwrap(), Some(0));
        assert!(!server.is_running());
        assert!(sim.live_responders().is_empty());
    }

    #[test]
    fn second_responder_on_same_port_dies() {
        let sim = SimNet::new();
        wired(&sim);
        let _first = sim.spawn("d", "iperf3", &args(&["-s", "-p", "6000"])).unwrap();
        let mut second = sim.spawn("d", "/usr/bin/iperf3", &args(&["-s", "-p", "6000"])).unwrap();
        assert!(!second.is_running());
        assert!(second.failure_output().contains("Address already in use"));
    }

    #[test]
    fn ping_flood_reports_loss() {
        let sim = SimNet::new();
        wired(&sim);
        sim.set_loss_percent(10.0);
        let out = sim
            .exec("s", "ping", &args(&["-f", "-w", "1", "-s", "56", "10.0.0.2"]))
            .unwrap();
        assert_eq!(out.status, Some(1));
        assert!(out.stdout.contains("1000 packets transmitted, 900 received, 10% packet loss"));
    }

    #[test]
    fn unreachable_without_route() {
        let sim = SimNet::new();
        wired(&sim);
        sim.set_cable_cut("a", true);
        let out = sim.exec("s", "ping", &args(&["-f", "-w", "1", "10.0.0.2"])).unwrap();
        assert!(out.stdout.contains("100% packet loss"));
        assert_eq!(sim.read_stat("s", "a", Stat::TxPackets).unwrap(), 0);
    }

    #[test]
    fn faults_fire_once_or_always() {
        let sim = SimNet::new();
        sim.fail_once(SimOp::AddDomain, Some("x"));
        assert!(sim.add_domain("x").is_err());
        sim.add_domain("x").unwrap();

        sim.fail_always(SimOp::DelDomain, None);
        assert!(sim.del_domain("x").is_err());
        assert!(sim.del_domain("x").is_err());
        sim.clear_faults();
        sim.del_domain("x").unwrap();
    }

    #[test]
    fn simulated_host_offers_two_candidates() {
        let sim = SimNet::simulated_host();
        let root = sim.links(Domain::Root).unwrap();
        let up: Vec<&str> = root
            .iter()
            .filter(|l| l.carrier == Some(true) && !l.is_loopback())
            .map(|l| l.name.as_str())
            .collect();
        assert_eq!(up, vec!["sim2", "sim3"]);
        assert!(!sim.link(Domain::Root, "sim0").unwrap().unwrap().admin_up);
    }

    #[test]
    fn pause_is_recorded_not_slept() {
        let sim = SimNet::new();
        sim.pause(Duration::from_secs(3600));
        assert_eq!(sim.paused(), Duration::from_secs(3600));
    }
}
