//! `--detect`: list adoptable interfaces and optionally blink their LEDs.
//! Builds nothing.

use std::fmt::Write as _;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::backend::{AdminState, NetBackend, OperState};
use crate::domain::Domain;
use crate::error::LinkError;
use crate::guard::eligibility;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub name: String,
    pub admin: AdminState,
    pub oper: OperState,
    pub carrier: Option<bool>,
    pub mtu: u32,
    pub addrs: Vec<String>,
    pub eligible: bool,
    pub reason: &'static str,
}

/// Every non-loopback interface in the default domain, sorted by name.
pub fn survey(backend: &dyn NetBackend) -> Result<Vec<Candidate>, LinkError> {
    let mut out: Vec<Candidate> = backend
        .links(Domain::Root)?
        .into_iter()
        .filter(|l| !l.is_loopback())
        .map(|l| {
            let verdict = eligibility(&l);
            Candidate {
                admin: l.admin_state(),
                oper: l.oper_state,
                carrier: l.carrier,
                mtu: l.mtu,
                addrs: l.assigned_addrs().map(|a| a.network.to_string()).collect(),
                eligible: verdict.is_eligible(),
                reason: verdict.reason(),
                name: l.name,
            }
        })
        .collect();
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

pub fn render_table(candidates: &[Candidate]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<16} {:<8} {:<15} {:<8} {:>6}  {:<20} STATUS",
        "INTERFACE", "ADMIN", "OPER", "CARRIER", "MTU", "ADDRESSES"
    );
    for c in candidates {
        let carrier = match c.carrier {
            Some(true) => "yes",
            Some(false) => "no",
            None => "-",
        };
        let addrs = if c.addrs.is_empty() {
            "-".to_string()
        } else {
            c.addrs.join(",")
        };
        let _ = writeln!(
            out,
            "{:<16} {:<8} {:<15} {:<8} {:>6}  {:<20} {}",
            c.name,
            c.admin.as_str(),
            c.oper.as_str(),
            carrier,
            c.mtu,
            addrs,
            c.reason
        );
    }
    let eligible = candidates.iter().filter(|c| c.eligible).count();
    let _ = writeln!(out, "{eligible} eligible for --auto");
    out
}

/// Blink each eligible interface in turn. Interfaces without LED support
/// are skipped; returns the ones that blinked.
pub fn blink(backend: &dyn NetBackend, candidates: &[Candidate], duration: Duration) -> Vec<String> {
    candidates
        .iter()
        .filter(|c| c.eligible)
        .filter_map(|c| match backend.identify(&c.name, duration) {
            Ok(()) => Some(c.name.clone()),
            Err(e) => {
                debug!(iface = %c.name, error = %e, "no identify support");
                None
            }
        })
        .collect()
}
