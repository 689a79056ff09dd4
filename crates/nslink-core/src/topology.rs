//! Topology Builder: two namespaces, one adopted interface in each.

use std::fmt;
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::backend::NetBackend;
use crate::config::LinkConfig;
use crate::domain::{Domain, DomainNames};
use crate::error::LinkError;
use crate::record::{RecordStore, RunRecord, RECORD_VERSION};
use crate::session::CancelFlag;

const CARRIER_POLL: Duration = Duration::from_millis(200);

/// The build sequence, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStep {
    Quiesce,
    CreateDomains,
    Loopback,
    Reparent,
    Configure,
    Address,
    Persist,
}

impl BuildStep {
    pub const ALL: [BuildStep; 7] = [
        BuildStep::Quiesce,
        BuildStep::CreateDomains,
        BuildStep::Loopback,
        BuildStep::Reparent,
        BuildStep::Configure,
        BuildStep::Address,
        BuildStep::Persist,
    ];
}

impl fmt::Display for BuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BuildStep::Quiesce => "quiesce interfaces",
            BuildStep::CreateDomains => "create namespaces",
            BuildStep::Loopback => "bring up loopback",
            BuildStep::Reparent => "re-parent interfaces",
            BuildStep::Configure => "configure mtu and link",
            BuildStep::Address => "assign addresses",
            BuildStep::Persist => "persist run record",
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BuildOptions {
    /// After bring-up, wait up to `carrier_wait` for link-detect.
    pub require_carrier: bool,
    pub carrier_wait: Duration,
}

/// The record describing a run before anything is built. Teardown works
/// from this in-memory copy until [`BuildStep::Persist`] writes it out.
pub fn plan(link: &LinkConfig, names: &DomainNames, pid: u32, port: Option<u16>) -> RunRecord {
    RunRecord {
        version: RECORD_VERSION,
        pid,
        created_at: Utc::now(),
        src_domain: names.src.clone(),
        dst_domain: names.dst.clone(),
        src_if: link.src_if.clone(),
        dst_if: link.dst_if.clone(),
        src_addr: link.src_addr.to_string(),
        dst_addr: link.dst_addr.to_string(),
        mtu: link.mtu,
        port,
    }
}

/// Run every [`BuildStep`] in order. The first fatal failure is returned
/// as [`LinkError::Acquisition`] naming the step; rolling back is the
/// caller's job.
pub fn build(
    backend: &dyn NetBackend,
    record: &RunRecord,
    link: &LinkConfig,
    opts: &BuildOptions,
    store: &RecordStore,
    cancel: &CancelFlag,
) -> Result<(), LinkError> {
    for step in BuildStep::ALL {
        cancel.check()?;
        debug!(step = %step, "topology step");
        match step {
            BuildStep::Quiesce => quiesce(backend, record)?,
            BuildStep::CreateDomains => create_domains(backend, record)?,
            BuildStep::Loopback => {
                for ns in [&record.src_domain, &record.dst_domain] {
                    backend
                        .set_admin(Domain::Named(ns), "lo", true)
                        .map_err(at(step))?;
                }
            }
            BuildStep::Reparent => {
                for (ns, iface) in record.ends() {
                    backend
                        .move_link(Domain::Root, iface, Domain::Named(ns))
                        .map_err(at(step))?;
                    debug!(iface, domain = ns, "interface re-parented");
                }
            }
            BuildStep::Configure => {
                for (ns, iface) in record.ends() {
                    backend
                        .set_mtu(Domain::Named(ns), iface, link.mtu)
                        .map_err(at(step))?;
                    backend
                        .set_admin(Domain::Named(ns), iface, true)
                        .map_err(at(step))?;
                }
                if opts.require_carrier {
                    for (ns, iface) in record.ends() {
                        wait_for_carrier(backend, ns, iface, opts.carrier_wait, cancel)?;
                    }
                }
            }
            BuildStep::Address => {
                let addrs = [link.src_addr, link.dst_addr];
                for ((ns, iface), addr) in record.ends().into_iter().zip(addrs) {
                    backend
                        .add_addr(Domain::Named(ns), iface, &addr)
                        .map_err(at(step))?;
                }
            }
            BuildStep::Persist => {
                let path = store.save(record).map_err(at(step))?;
                debug!(path = %path.display(), "run record persisted");
            }
        }
    }
    info!(
        src = %format!("{}@{}", record.src_if, record.src_domain),
        dst = %format!("{}@{}", record.dst_if, record.dst_domain),
        mtu = link.mtu,
        "topology built"
    );
    Ok(())
}

fn at(step: BuildStep) -> impl FnOnce(anyhow::Error) -> LinkError {
    move |source| LinkError::Acquisition { step, source }
}

/// Down/flush in the default domain is best-effort: a later step fails
/// loudly if it mattered. A missing interface is still fatal.
fn quiesce(backend: &dyn NetBackend, record: &RunRecord) -> Result<(), LinkError> {
    let step = BuildStep::Quiesce;
    for (_, iface) in record.ends() {
        if backend.link(Domain::Root, iface).map_err(at(step))?.is_none() {
            return Err(at(step)(anyhow!(
                "interface '{iface}' disappeared from the default namespace"
            )));
        }
        if let Err(e) = backend.set_admin(Domain::Root, iface, false) {
            warn!(iface, step = %step, error = %e, "could not set interface down");
        }
        if let Err(e) = backend.flush_addrs(Domain::Root, iface) {
            warn!(iface, step = %step, error = %e, "could not flush addresses");
        }
    }
    Ok(())
}

fn create_domains(backend: &dyn NetBackend, record: &RunRecord) -> Result<(), LinkError> {
    let step = BuildStep::CreateDomains;
    let existing = backend.domains().map_err(at(step))?;
    for ns in [&record.src_domain, &record.dst_domain] {
        if existing.iter().any(|d| d == ns) {
            debug!(domain = %ns, "namespace already present, reusing");
            continue;
        }
        backend.add_domain(ns).map_err(at(step))?;
    }
    Ok(())
}

fn wait_for_carrier(
    backend: &dyn NetBackend,
    ns: &str,
    iface: &str,
    timeout: Duration,
    cancel: &CancelFlag,
) -> Result<(), LinkError> {
    let mut waited = Duration::ZERO;
    loop {
        let carrier = backend
            .link(Domain::Named(ns), iface)
            .map_err(at(BuildStep::Configure))?
            .and_then(|l| l.carrier);
        if carrier == Some(true) {
            debug!(iface, domain = ns, waited_ms = waited.as_millis() as u64, "carrier up");
            return Ok(());
        }
        if waited >= timeout {
            return Err(at(BuildStep::Configure)(anyhow!(
                "no carrier on '{iface}' after {}ms",
                timeout.as_millis()
            )));
        }
        cancel.check()?;
        backend.pause(CARRIER_POLL);
        waited += CARRIER_POLL;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::AdminState;
    use crate::sim::{SimNet, SimOp};

    struct Fixture {
        sim: SimNet,
        link: LinkConfig,
        record: RunRecord,
        store: RecordStore,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let sim = SimNet::new();
        sim.add_cabled_pair("eth1", "eth2");
        let link = LinkConfig {
            src_if: "eth1".into(),
            dst_if: "eth2".into(),
            src_addr: "10.10.10.1/30".parse().unwrap(),
            dst_addr: "10.10.10.2/30".parse().unwrap(),
            mtu: 9000,
        };
        let names = DomainNames::for_pid("nslink", 4242);
        let record = plan(&link, &names, 4242, Some(50000));
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path());
        Fixture {
            sim,
            link,
            record,
            store,
            _dir: dir,
        }
    }

    fn run(f: &Fixture, opts: BuildOptions) -> Result<(), LinkError> {
        build(&f.sim, &f.record, &f.link, &opts, &f.store, &CancelFlag::new())
    }

    #[test]
    fn build_confines_interfaces_to_their_domains() {
        let f = fixture();
        run(&f, BuildOptions::default()).unwrap();

        assert!(f.sim.link(Domain::Root, "eth1").unwrap().is_none());
        assert!(f.sim.link(Domain::Root, "eth2").unwrap().is_none());

        let src = f.sim.link(Domain::Named("nslink-4242-src"), "eth1").unwrap().unwrap();
        assert_eq!(src.admin_state(), AdminState::Up);
        assert_eq!(src.mtu, 9000);
        let addrs: Vec<String> = src.assigned_addrs().map(|a| a.network.to_string()).collect();
        assert_eq!(addrs, vec!["10.10.10.1/30"]);

        let lo = f.sim.link(Domain::Named("nslink-4242-dst"), "lo").unwrap().unwrap();
        assert!(lo.admin_up);

        assert_eq!(f.store.load(4242).unwrap(), Some(f.record.clone()));
    }

    #[test]
    fn steps_run_in_declared_order() {
        let f = fixture();
        run(&f, BuildOptions::default()).unwrap();
        let ops = f.sim.ops();
        let pos = |needle: &str| {
            ops.iter()
                .position(|o| o.starts_with(needle))
                .unwrap_or_else(|| panic!("missing op {needle}: {ops:?}"))
        };
        assert!(pos("eth1 down in default") < pos("add netns"));
        assert!(pos("add netns nslink-4242-dst") < pos("lo up in nslink-4242-src"));
        assert!(pos("lo up") < pos("move eth1"));
        assert!(pos("move eth2") < pos("eth1 mtu"));
        assert!(pos("eth2 up in") < pos("eth1 addr"));
    }

    #[test]
    fn reparent_failure_names_the_step_and_skips_persist() {
        let f = fixture();
        f.sim.fail_once(SimOp::MoveLink, Some("eth2"));
        let err = run(&f, BuildOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            LinkError::Acquisition {
                step: BuildStep::Reparent,
                ..
            }
        ));
        // Partial progress: eth1 moved, eth2 still in the default domain.
        assert_eq!(f.sim.location("eth1"), Some(Some("nslink-4242-src".into())));
        assert_eq!(f.sim.location("eth2"), Some(None));
        assert_eq!(f.store.load(4242).unwrap(), None);
    }

    #[test]
    fn quiesce_failures_are_tolerated() {
        let f = fixture();
        f.sim.fail_once(SimOp::FlushAddrs, Some("eth1"));
        f.sim.fail_once(SimOp::SetAdmin, Some("eth2"));
        run(&f, BuildOptions::default()).unwrap();
    }

    #[test]
    fn missing_interface_is_fatal_even_in_quiesce() {
        let f = fixture();
        let mut record = f.record.clone();
        record.dst_if = "eth9".into();
        let err = build(
            &f.sim,
            &record,
            &f.link,
            &BuildOptions::default(),
            &f.store,
            &CancelFlag::new(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            LinkError::Acquisition {
                step: BuildStep::Quiesce,
                ..
            }
        ));
        assert!(f.sim.domain_names().is_empty());
    }

    #[test]
    fn existing_domains_are_reused() {
        let f = fixture();
        f.sim.add_domain("nslink-4242-src").unwrap();
        run(&f, BuildOptions::default()).unwrap();
        assert_eq!(f.sim.domain_names().len(), 2);
    }

    #[test]
    fn carrier_wait_times_out_on_dead_cable() {
        let f = fixture();
        f.sim.set_cable_cut("eth1", true);
        let opts = BuildOptions {
            require_carrier: true,
            carrier_wait: Duration::from_secs(1),
        };
        let err = run(&f, opts).unwrap_err();
        assert!(matches!(
            err,
            LinkError::Acquisition {
                step: BuildStep::Configure,
                ..
            }
        ));
        assert_eq!(err.kind(), crate::error::ErrorKind::Acquisition);
        let chain = format!("{:#}", anyhow::Error::from(err));
        assert!(chain.contains("no carrier on 'eth1'"), "{chain}");
        assert_eq!(f.sim.paused(), Duration::from_secs(1));
    }

    #[test]
    fn carrier_wait_passes_on_live_cable() {
        let f = fixture();
        let opts = BuildOptions {
            require_carrier: true,
            carrier_wait: Duration::from_secs(5),
        };
        run(&f, opts).unwrap();
    }

    #[test]
    fn cancelled_build_stops_before_first_mutation() {
        let f = fixture();
        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = build(
            &f.sim,
            &f.record,
            &f.link,
            &BuildOptions::default(),
            &f.store,
            &cancel,
        )
        .unwrap_err();
        assert!(matches!(err, LinkError::Interrupted));
        assert!(f.sim.ops().is_empty());
    }

    #[test]
    fn step_names_read_as_actions() {
        assert_eq!(BuildStep::Reparent.to_string(), "re-parent interfaces");
        assert_eq!(BuildStep::ALL[0], BuildStep::Quiesce);
        assert_eq!(BuildStep::ALL[6], BuildStep::Persist);
    }
}
