//! Isolation-domain addressing and per-run naming.

use std::fmt;

/// Where a kernel operation is aimed: the host's default namespace or a
/// named network namespace under `/run/netns`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain<'a> {
    Root,
    Named(&'a str),
}

impl<'a> Domain<'a> {
    pub fn name(&self) -> Option<&'a str> {
        match self {
            Domain::Root => None,
            Domain::Named(name) => Some(name),
        }
    }
}

impl fmt::Display for Domain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Domain::Root => write!(f, "default"),
            Domain::Named(name) => write!(f, "{name}"),
        }
    }
}

/// The pair of namespace names owned by one run.
///
/// Names embed the owning PID so concurrent invocations never collide, and
/// so a later `--cleanup` can tell whether the owner is still alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainNames {
    pub src: String,
    pub dst: String,
}

impl DomainNames {
    pub fn for_pid(prefix: &str, pid: u32) -> Self {
        Self {
            src: format!("{prefix}-{pid}-src"),
            dst: format!("{prefix}-{pid}-dst"),
        }
    }

    pub fn for_current_process(prefix: &str) -> Self {
        Self::for_pid(prefix, std::process::id())
    }
}

/// Extract the owner PID from a namespace name produced by [`DomainNames`].
///
/// Returns `None` for names that do not carry `prefix`, so foreign
/// namespaces are never considered ours.
pub fn owner_pid(prefix: &str, name: &str) -> Option<u32> {
    let rest = name.strip_prefix(prefix)?.strip_prefix('-')?;
    let (pid, role) = rest.split_once('-')?;
    if role != "src" && role != "dst" {
        return None;
    }
    pid.parse().ok()
}

/// Whether a process with `pid` currently exists on this host.
pub fn pid_alive(pid: u32) -> bool {
    pid == std::process::id() || std::path::Path::new(&format!("/proc/{pid}")).exists()
}

/// Effective uid 0. Namespace work needs CAP_NET_ADMIN and CAP_SYS_ADMIN,
/// which in practice means root.
pub fn running_as_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_embed_pid_and_role() {
        let names = DomainNames::for_pid("nslink", 4242);
        assert_eq!(names.src, "nslink-4242-src");
        assert_eq!(names.dst, "nslink-4242-dst");
    }

    #[test]
    fn owner_pid_round_trips_generated_names() {
        let names = DomainNames::for_pid("nslink", 77);
        assert_eq!(owner_pid("nslink", &names.src), Some(77));
        assert_eq!(owner_pid("nslink", &names.dst), Some(77));
    }

    #[test]
    fn owner_pid_rejects_foreign_names() {
        assert_eq!(owner_pid("nslink", "docker-abc"), None);
        assert_eq!(owner_pid("nslink", "nslink-12-mid"), None);
        assert_eq!(owner_pid("nslink", "nslinkx-12-src"), None);
        assert_eq!(owner_pid("nslink", "nslink-abc-src"), None);
    }

    #[test]
    fn current_process_is_alive() {
        assert!(pid_alive(std::process::id()));
        // Above the kernel's maximum pid_max (2^22).
        assert!(!pid_alive(9_999_999));
    }

    #[test]
    fn domain_display() {
        assert_eq!(Domain::Root.to_string(), "default");
        assert_eq!(Domain::Named("ns1").to_string(), "ns1");
        assert_eq!(Domain::Named("ns1").name(), Some("ns1"));
        assert_eq!(Domain::Root.name(), None);
    }
}
