//! Interface State Guard: preconditions checked before any mutation.

use tracing::{debug, warn};

use crate::backend::{AdminState, LinkInfo, NetBackend};
use crate::config::GuardPolicy;
use crate::domain::Domain;
use crate::error::{GuardError, LinkError};

/// Name prefixes of software devices that are never adopted automatically.
const VIRTUAL_PREFIXES: &[&str] = &["lo", "docker", "br-", "virbr", "veth", "tun", "tap", "wg"];

/// Pure precondition check on an interface as observed in the default domain.
///
/// Order matters: existence, then admin state, then addressing, then carrier.
pub fn check(iface: &str, info: Option<&LinkInfo>, policy: &GuardPolicy) -> Result<(), GuardError> {
    let Some(info) = info else {
        return Err(GuardError::NotFound {
            iface: iface.to_string(),
        });
    };

    if policy.require_down {
        let acceptable = match info.admin_state() {
            AdminState::Down => true,
            AdminState::Unknown => policy.accept_unknown,
            AdminState::Up => false,
        };
        if !acceptable {
            return Err(GuardError::NotDown {
                iface: iface.to_string(),
                state: info.admin_state().as_str().to_string(),
            });
        }
    }

    let assigned: Vec<String> = info.assigned_addrs().map(|a| a.network.to_string()).collect();
    if !assigned.is_empty() {
        return Err(GuardError::HasAddress {
            iface: iface.to_string(),
            addrs: assigned,
        });
    }

    // Carrier is only observable on an interface that is up; a down one
    // is re-checked after bring-up by the builder.
    if policy.require_carrier && info.carrier == Some(false) {
        return Err(GuardError::NoCarrier {
            iface: iface.to_string(),
        });
    }

    Ok(())
}

/// Look the interface up in the default domain and apply [`check`].
///
/// Residual link-scope addresses are flushed as a corrective action.
pub fn validate(
    backend: &dyn NetBackend,
    iface: &str,
    policy: &GuardPolicy,
) -> Result<LinkInfo, LinkError> {
    let info = backend.link(Domain::Root, iface)?;
    check(iface, info.as_ref(), policy)?;
    let Some(info) = info else {
        return Err(GuardError::NotFound {
            iface: iface.to_string(),
        }
        .into());
    };

    if !info.addrs.is_empty() {
        debug!(iface, count = info.addrs.len(), "flushing residual addresses");
        if let Err(e) = backend.flush_addrs(Domain::Root, iface) {
            warn!(iface, error = %e, "could not flush residual addresses");
        }
    }

    debug!(iface, state = info.admin_state().as_str(), "interface passed guard");
    Ok(info)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    Excluded(&'static str),
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible)
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Eligibility::Eligible => "eligible",
            Eligibility::Excluded(reason) => reason,
        }
    }
}

/// Whether `--auto` may adopt this interface: a physical-looking Ethernet
/// device that is up, has carrier, and carries no configured address.
pub fn eligibility(link: &LinkInfo) -> Eligibility {
    if link.is_loopback() {
        return Eligibility::Excluded("loopback");
    }
    if VIRTUAL_PREFIXES.iter().any(|p| link.name.starts_with(p)) {
        return Eligibility::Excluded("virtual device");
    }
    if link.link_type != "ether" {
        return Eligibility::Excluded("not ethernet");
    }
    if link.admin_state() == AdminState::Down {
        return Eligibility::Excluded("admin down");
    }
    if link.carrier != Some(true) {
        return Eligibility::Excluded("no carrier");
    }
    if link.has_assigned_addr() {
        return Eligibility::Excluded("has address");
    }
    Eligibility::Eligible
}

/// Eligible interface names in the default domain, sorted.
pub fn candidates(backend: &dyn NetBackend) -> Result<Vec<String>, LinkError> {
    let mut names: Vec<String> = backend
        .links(Domain::Root)?
        .into_iter()
        .filter(|l| eligibility(l).is_eligible())
        .map(|l| l.name)
        .collect();
    names.sort();
    Ok(names)
}

/// First two eligible interfaces, source then destination.
pub fn auto_select(backend: &dyn NetBackend) -> Result<(String, String), LinkError> {
    let names = candidates(backend)?;
    match names.as_slice() {
        [src, dst, ..] => {
            debug!(src = %src, dst = %dst, total = names.len(), "auto-selected interfaces");
            Ok((src.clone(), dst.clone()))
        }
        _ => Err(LinkError::InsufficientCandidates { names }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{AddrInfo, AddrScope, OperState};
    use crate::sim::SimNet;

    fn info(admin_up: bool, oper: OperState, carrier: Option<bool>, addr: Option<&str>) -> LinkInfo {
        LinkInfo {
            name: "eth1".into(),
            admin_up,
            oper_state: oper,
            carrier,
            mtu: 1500,
            link_type: "ether".into(),
            addrs: addr
                .map(|a| {
                    vec![AddrInfo {
                        network: a.parse().unwrap(),
                        scope: AddrScope::Global,
                    }]
                })
                .unwrap_or_default(),
        }
    }

    fn strict() -> GuardPolicy {
        GuardPolicy::default()
    }

    #[test]
    fn missing_interface_is_not_found() {
        assert!(matches!(
            check("eth9", None, &strict()),
            Err(GuardError::NotFound { .. })
        ));
    }

    #[test]
    fn up_interface_is_rejected() {
        let up = info(true, OperState::Up, Some(true), None);
        let err = check("eth1", Some(&up), &strict()).unwrap_err();
        assert!(matches!(err, GuardError::NotDown { ref state, .. } if state == "up"));
    }

    #[test]
    fn unknown_state_needs_explicit_acceptance() {
        let unknown = info(true, OperState::Unknown, None, None);
        assert!(matches!(
            check("eth1", Some(&unknown), &strict()),
            Err(GuardError::NotDown { ref state, .. }) if state == "unknown"
        ));
        let lenient = GuardPolicy {
            accept_unknown: true,
            ..strict()
        };
        assert!(check("eth1", Some(&unknown), &lenient).is_ok());
    }

    #[test]
    fn every_precondition_combination() {
        let carrier_policy = GuardPolicy {
            require_carrier: true,
            ..strict()
        };
        for down in [true, false] {
            for has_addr in [true, false] {
                for carrier_absent in [true, false] {
                    let carrier = if down {
                        None
                    } else {
                        Some(!carrier_absent)
                    };
                    let oper = if down { OperState::Down } else { OperState::Up };
                    let link = info(!down, oper, carrier, has_addr.then_some("10.0.0.9/24"));
                    let result = check("eth1", Some(&link), &carrier_policy);
                    match (down, has_addr, carrier_absent) {
                        (false, _, _) => {
                            assert!(matches!(result, Err(GuardError::NotDown { .. })))
                        }
                        (true, true, _) => {
                            assert!(matches!(result, Err(GuardError::HasAddress { .. })))
                        }
                        // Carrier cannot be observed while down.
                        (true, false, _) => assert!(result.is_ok()),
                    }
                }
            }
        }
    }

    #[test]
    fn carrier_checked_when_up_allowed() {
        let policy = GuardPolicy {
            require_down: false,
            accept_unknown: false,
            require_carrier: true,
        };
        let dead = info(true, OperState::Down, Some(false), None);
        assert!(matches!(
            check("eth1", Some(&dead), &policy),
            Err(GuardError::NoCarrier { .. })
        ));
        let live = info(true, OperState::Up, Some(true), None);
        assert!(check("eth1", Some(&live), &policy).is_ok());
    }

    #[test]
    fn validate_reads_default_domain() {
        let sim = SimNet::new();
        sim.add_interface("eth1");
        assert!(validate(&sim, "eth1", &strict()).is_ok());
        sim.set_admin_state("eth1", true);
        assert!(matches!(
            validate(&sim, "eth1", &strict()),
            Err(LinkError::Guard(GuardError::NotDown { .. }))
        ));
        assert!(matches!(
            validate(&sim, "eth7", &strict()),
            Err(LinkError::Guard(GuardError::NotFound { .. }))
        ));
    }

    #[test]
    fn eligibility_reasons() {
        let mut lo = info(true, OperState::Unknown, Some(true), None);
        lo.name = "lo".into();
        lo.link_type = "loopback".into();
        assert_eq!(eligibility(&lo), Eligibility::Excluded("loopback"));

        let mut docker = info(true, OperState::Up, Some(true), None);
        docker.name = "docker0".into();
        assert_eq!(eligibility(&docker).reason(), "virtual device");

        assert_eq!(
            eligibility(&info(false, OperState::Down, None, None)),
            Eligibility::Excluded("admin down")
        );
        assert_eq!(
            eligibility(&info(true, OperState::Down, Some(false), None)),
            Eligibility::Excluded("no carrier")
        );
        assert_eq!(
            eligibility(&info(true, OperState::Up, Some(true), Some("192.168.1.5/24"))),
            Eligibility::Excluded("has address")
        );
        assert!(eligibility(&info(true, OperState::Up, Some(true), None)).is_eligible());
    }

    #[test]
    fn auto_select_needs_two() {
        let sim = SimNet::new();
        sim.add_cabled_pair("eth2", "eth3");
        sim.set_admin_state("eth2", true);
        // Peer still down, so eth2 has no carrier yet.
        assert!(matches!(
            auto_select(&sim),
            Err(LinkError::InsufficientCandidates { ref names }) if names.is_empty()
        ));
        sim.set_admin_state("eth3", true);
        assert_eq!(auto_select(&sim).unwrap(), ("eth2".into(), "eth3".into()));
    }
}
