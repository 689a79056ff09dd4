//! Error taxonomy for the link tester.
//!
//! Precondition errors abort before anything is built, acquisition and
//! measurement errors abort after teardown has been armed. Measurement
//! warnings are not errors at all; they travel inside the report.

use thiserror::Error;

use crate::topology::BuildStep;

// ── Guard ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("interface '{iface}' not found in the default namespace")]
    NotFound { iface: String },

    #[error("interface '{iface}' is administratively {state}, expected down")]
    NotDown { iface: String, state: String },

    #[error("interface '{iface}' has assigned address(es): {}", .addrs.join(", "))]
    HasAddress { iface: String, addrs: Vec<String> },

    #[error("interface '{iface}' reports no carrier")]
    NoCarrier { iface: String },
}

impl GuardError {
    pub fn iface(&self) -> &str {
        match self {
            GuardError::NotFound { iface }
            | GuardError::NotDown { iface, .. }
            | GuardError::HasAddress { iface, .. }
            | GuardError::NoCarrier { iface } => iface,
        }
    }

    /// Corrective action for the operator.
    pub fn hint(&self) -> String {
        match self {
            GuardError::NotFound { iface } => {
                format!("check `ip link show {iface}`; a crashed run may still hold it (try `nslink --cleanup`)")
            }
            GuardError::NotDown { iface, .. } => {
                format!("bring interface down first: ip link set {iface} down")
            }
            GuardError::HasAddress { iface, .. } => {
                format!("remove its addresses first: ip addr flush dev {iface}")
            }
            GuardError::NoCarrier { iface } => {
                format!("check the cable/peer on {iface}, or drop --require-carrier")
            }
        }
    }
}

// ── Link tester ─────────────────────────────────────────────────────

/// Coarse class of a [`LinkError`], used for exit codes and for deciding
/// whether teardown has anything to undo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Precondition,
    Acquisition,
    Measurement,
    Interrupted,
    Usage,
    System,
}

impl ErrorKind {
    pub fn exit_code(self) -> u8 {
        match self {
            ErrorKind::Usage | ErrorKind::System => 1,
            ErrorKind::Precondition => 2,
            ErrorKind::Acquisition => 3,
            ErrorKind::Measurement => 4,
            ErrorKind::Interrupted => 130,
        }
    }
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("must run as root (CAP_NET_ADMIN and CAP_SYS_ADMIN are required)")]
    NotRoot,

    #[error(transparent)]
    Guard(#[from] GuardError),

    #[error("need two eligible interfaces (admin up, carrier, no address), found {}: [{}]", .names.len(), .names.join(", "))]
    InsufficientCandidates { names: Vec<String> },

    #[error("interface '{iface}' belongs to a stale run (pid {pid}, namespaces {src_domain}/{dst_domain})")]
    StaleRun {
        iface: String,
        pid: u32,
        src_domain: String,
        dst_domain: String,
    },

    #[error("topology step '{step}' failed")]
    Acquisition {
        step: BuildStep,
        #[source]
        source: anyhow::Error,
    },

    #[error("measurement setup failed: {0}")]
    Measurement(String),

    #[error("responder '{program}' failed to start in {domain}: {detail}")]
    ResponderStart {
        program: String,
        domain: String,
        detail: String,
    },

    #[error("cannot {op} while the session is {phase}")]
    InvalidTransition { op: &'static str, phase: String },

    #[error("interrupted")]
    Interrupted,

    #[error("invalid configuration: {0}")]
    Config(String),

    /// A host query failed outside any topology step (e.g. `ip` missing).
    #[error(transparent)]
    System(#[from] anyhow::Error),
}

impl LinkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LinkError::NotRoot
            | LinkError::Guard(_)
            | LinkError::InsufficientCandidates { .. }
            | LinkError::StaleRun { .. } => ErrorKind::Precondition,
            LinkError::Acquisition { .. } => ErrorKind::Acquisition,
            LinkError::Measurement(_) | LinkError::ResponderStart { .. } => {
                ErrorKind::Measurement
            }
            LinkError::Interrupted => ErrorKind::Interrupted,
            LinkError::InvalidTransition { .. } | LinkError::Config(_) => ErrorKind::Usage,
            LinkError::System(_) => ErrorKind::System,
        }
    }

    /// What the operator should do next, when there is something useful to say.
    pub fn hint(&self) -> Option<String> {
        match self {
            LinkError::NotRoot => Some("re-run with sudo, or pass --sudo".into()),
            LinkError::Guard(e) => Some(e.hint()),
            LinkError::InsufficientCandidates { .. } => {
                Some("name the interfaces explicitly with --src-if/--dst-if".into())
            }
            LinkError::StaleRun { pid, .. } => Some(format!(
                "restore it first: nslink --cleanup --pid {pid}"
            )),
            LinkError::Acquisition { .. } => {
                Some("partial topology was rolled back; see the log above for the failing command".into())
            }
            LinkError::ResponderStart { program, .. } => Some(format!(
                "check that {program} is installed and the port is free (use --port to pick another)"
            )),
            LinkError::Measurement(_) => None,
            LinkError::InvalidTransition { .. } => None,
            LinkError::Interrupted => None,
            LinkError::Config(_) => Some("see nslink --help".into()),
            LinkError::System(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_errors_are_preconditions() {
        let err = LinkError::from(GuardError::NotDown {
            iface: "eth1".into(),
            state: "up".into(),
        });
        assert_eq!(err.kind(), ErrorKind::Precondition);
        assert_eq!(err.kind().exit_code(), 2);
        assert!(err.to_string().contains("eth1"));
        assert!(err.hint().unwrap().contains("ip link set eth1 down"));
    }

    #[test]
    fn acquisition_error_names_step_and_keeps_source() {
        let err = LinkError::Acquisition {
            step: BuildStep::Reparent,
            source: anyhow::anyhow!("RTNETLINK answers: Invalid argument"),
        };
        assert_eq!(err.kind(), ErrorKind::Acquisition);
        assert!(err.to_string().contains("re-parent"));
        let chain = format!("{:#}", anyhow::Error::from(err));
        assert!(chain.contains("Invalid argument"), "{chain}");
    }

    #[test]
    fn has_address_lists_addresses() {
        let err = GuardError::HasAddress {
            iface: "eth2".into(),
            addrs: vec!["192.168.1.4/24".into(), "10.0.0.1/8".into()],
        };
        assert_eq!(
            err.to_string(),
            "interface 'eth2' has assigned address(es): 192.168.1.4/24, 10.0.0.1/8"
        );
        assert_eq!(err.iface(), "eth2");
    }

    #[test]
    fn system_errors_exit_with_generic_code() {
        let err = LinkError::from(anyhow::anyhow!("ip: command not found"));
        assert_eq!(err.kind(), ErrorKind::System);
        assert_eq!(err.kind().exit_code(), 1);
        assert_eq!(err.to_string(), "ip: command not found");
    }

    #[test]
    fn exit_codes_are_distinct_and_nonzero() {
        let kinds = [
            ErrorKind::Usage,
            ErrorKind::Precondition,
            ErrorKind::Acquisition,
            ErrorKind::Measurement,
            ErrorKind::Interrupted,
        ];
        let mut codes: Vec<u8> = kinds.iter().map(|k| k.exit_code()).collect();
        assert!(codes.iter().all(|c| *c != 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
    }
}
