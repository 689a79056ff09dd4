//! Teardown/Recovery Engine.
//!
//! Every sub-step is independent and re-entrant: a failure is recorded
//! and the next step still runs, and a step whose work is already done is
//! a no-op. Teardown never returns an error.

use std::fmt;

use tracing::{debug, info, warn};

use crate::backend::NetBackend;
use crate::domain::{owner_pid, pid_alive, Domain, DomainNames};
use crate::record::{RecordStore, RunRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    Inspect,
    Down,
    Flush,
    Return,
    Quiesce,
    Evict,
    DeleteDomain,
    RemoveRecord,
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TeardownStep::Inspect => "inspect",
            TeardownStep::Down => "set down",
            TeardownStep::Flush => "flush addresses",
            TeardownStep::Return => "return to default namespace",
            TeardownStep::Quiesce => "quiesce in default namespace",
            TeardownStep::Evict => "evict leftover interface",
            TeardownStep::DeleteDomain => "delete namespace",
            TeardownStep::RemoveRecord => "remove run record",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownIssue {
    pub step: TeardownStep,
    pub target: String,
    pub detail: String,
}

impl fmt::Display for TeardownIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.step, self.target, self.detail)
    }
}

/// What a teardown pass did and what it could not do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Interfaces moved back to the default namespace.
    pub restored: Vec<String>,
    pub deleted_domains: Vec<String>,
    pub removed_records: Vec<u32>,
    pub issues: Vec<TeardownIssue>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn merge(&mut self, other: TeardownReport) {
        self.restored.extend(other.restored);
        self.deleted_domains.extend(other.deleted_domains);
        self.removed_records.extend(other.removed_records);
        self.issues.extend(other.issues);
    }

    /// Nothing was found to undo.
    pub fn is_noop(&self) -> bool {
        self.restored.is_empty() && self.deleted_domains.is_empty() && self.removed_records.is_empty()
    }

    fn attempt(&mut self, step: TeardownStep, target: &str, result: anyhow::Result<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(step = %step, target, error = %e, "teardown step failed, continuing");
                self.issues.push(TeardownIssue {
                    step,
                    target: target.to_string(),
                    detail: format!("{e:#}"),
                });
                false
            }
        }
    }
}

/// Undo everything `record` describes, then delete the record.
pub fn teardown(backend: &dyn NetBackend, record: &RunRecord, store: &RecordStore) -> TeardownReport {
    let mut report = TeardownReport::default();
    debug!(pid = record.pid, src = %record.src_domain, dst = %record.dst_domain, "teardown");

    for (ns, iface) in record.ends() {
        restore_interface(backend, ns, iface, &mut report);
    }
    for ns in [&record.src_domain, &record.dst_domain] {
        release_domain(backend, ns, &mut report);
    }
    if report.attempt(TeardownStep::RemoveRecord, &record.pid.to_string(), store.remove(record.pid)) {
        report.removed_records.push(record.pid);
    }

    info!(
        pid = record.pid,
        restored = report.restored.len(),
        issues = report.issues.len(),
        "teardown finished"
    );
    report
}

/// An uninspectable domain counts as present: it is still worth a
/// delete attempt.
fn domain_present(backend: &dyn NetBackend, ns: &str, report: &mut TeardownReport) -> bool {
    match backend.domain_exists(ns) {
        Ok(present) => present,
        Err(e) => {
            report.attempt(TeardownStep::Inspect, ns, Err(e));
            true
        }
    }
}

fn restore_interface(backend: &dyn NetBackend, ns: &str, iface: &str, report: &mut TeardownReport) {
    if !domain_present(backend, ns, report) {
        debug!(iface, domain = ns, "namespace already gone");
        return;
    }
    let domain = Domain::Named(ns);
    match backend.link(domain, iface) {
        Ok(Some(_)) => {}
        Ok(None) => {
            debug!(iface, domain = ns, "interface not in namespace, nothing to return");
            return;
        }
        Err(e) => {
            report.attempt(TeardownStep::Inspect, iface, Err(e));
            return;
        }
    }

    report.attempt(TeardownStep::Down, iface, backend.set_admin(domain, iface, false));
    report.attempt(TeardownStep::Flush, iface, backend.flush_addrs(domain, iface));
    if report.attempt(TeardownStep::Return, iface, backend.move_link(domain, iface, Domain::Root)) {
        debug!(iface, from = ns, "interface returned to default namespace");
        report.restored.push(iface.to_string());
        quiesce_in_root(backend, iface, report);
    }
}

/// The kernel resets a moved device, but confirm it came back down and
/// address-free.
fn quiesce_in_root(backend: &dyn NetBackend, iface: &str, report: &mut TeardownReport) {
    let Ok(Some(info)) = backend.link(Domain::Root, iface) else {
        return;
    };
    if info.admin_up {
        report.attempt(TeardownStep::Quiesce, iface, backend.set_admin(Domain::Root, iface, false));
    }
    if info.has_assigned_addr() {
        report.attempt(TeardownStep::Quiesce, iface, backend.flush_addrs(Domain::Root, iface));
    }
}

/// Move any remaining non-loopback interface out of `ns`, then delete it.
fn release_domain(backend: &dyn NetBackend, ns: &str, report: &mut TeardownReport) {
    if !domain_present(backend, ns, report) {
        return;
    }
    let domain = Domain::Named(ns);
    match backend.links(domain) {
        Ok(links) => {
            for link in links.iter().filter(|l| !l.is_loopback()) {
                let name = link.name.as_str();
                warn!(iface = name, domain = ns, "evicting interface left in namespace");
                report.attempt(TeardownStep::Down, name, backend.set_admin(domain, name, false));
                if report.attempt(TeardownStep::Evict, name, backend.move_link(domain, name, Domain::Root)) {
                    report.restored.push(link.name.clone());
                }
            }
        }
        Err(e) => {
            report.attempt(TeardownStep::Inspect, ns, Err(e));
        }
    }
    if report.attempt(TeardownStep::DeleteDomain, ns, backend.del_domain(ns)) {
        debug!(domain = ns, "namespace deleted");
        report.deleted_domains.push(ns.to_string());
    }
}

/// Tear down a specific run. Without a record, falls back to the
/// namespaces that run would have created.
pub fn cleanup_pid(
    backend: &dyn NetBackend,
    store: &RecordStore,
    prefix: &str,
    pid: u32,
) -> TeardownReport {
    let mut report = TeardownReport::default();
    match store.load(pid) {
        Ok(Some(record)) => return teardown(backend, &record, store),
        Ok(None) => debug!(pid, "no run record, releasing namespaces by name"),
        Err(e) => {
            report.attempt(TeardownStep::Inspect, &pid.to_string(), Err(e));
        }
    }
    let names = DomainNames::for_pid(prefix, pid);
    for ns in [&names.src, &names.dst] {
        release_domain(backend, ns, &mut report);
    }
    report
}

/// Tear down every recorded run whose owner is gone. Runs whose owner
/// is still alive are left alone.
pub fn cleanup_stale(backend: &dyn NetBackend, store: &RecordStore) -> TeardownReport {
    let mut report = TeardownReport::default();
    let records = match store.list() {
        Ok(records) => records,
        Err(e) => {
            report.attempt(TeardownStep::Inspect, &store.dir().display().to_string(), Err(e));
            return report;
        }
    };
    for record in records {
        if !record.is_stale() {
            info!(pid = record.pid, "run still active, skipping (use --pid to force)");
            continue;
        }
        report.merge(teardown(backend, &record, store));
    }
    report
}

/// Delete `prefix`-named namespaces whose owner is dead and which have
/// no record: a crash between namespace creation and record persistence.
pub fn sweep_orphans(backend: &dyn NetBackend, prefix: &str, store: &RecordStore) -> TeardownReport {
    let mut report = TeardownReport::default();
    let domains = match backend.domains() {
        Ok(d) => d,
        Err(e) => {
            report.attempt(TeardownStep::Inspect, "namespaces", Err(e));
            return report;
        }
    };
    for ns in domains {
        let Some(pid) = owner_pid(prefix, &ns) else {
            continue;
        };
        if pid_alive(pid) || matches!(store.load(pid), Ok(Some(_))) {
            continue;
        }
        info!(domain = %ns, pid, "removing orphaned namespace");
        release_domain(backend, &ns, &mut report);
    }
    report
}
