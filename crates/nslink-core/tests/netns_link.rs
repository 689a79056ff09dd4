//! Privileged end-to-end test on a real veth pair.
//!
//! **Requirements:** root, `ip netns`, and `iperf3`. Skips otherwise.
//!
//! ```bash
//! sudo cargo test -p nslink-core --test netns_link -- --nocapture
//! ```

use std::process::Command;

use nslink_core::backend::{AdminState, NetBackend};
use nslink_core::config::{ConfigInput, LinkInput, StateInput, TestInput};
use nslink_core::domain::Domain;
use nslink_core::iproute::IpRoute2;
use nslink_core::test_util::{check_privileges, tool_available, unique_name};
use nslink_core::{CancelFlag, Session};

/// Deletes the veth pair on drop, wherever the test stopped.
struct VethPair {
    a: String,
    b: String,
}

impl VethPair {
    fn create() -> Self {
        let a = unique_name("nslva");
        let b = unique_name("nslvb");
        let status = Command::new("ip")
            .args(["link", "add", &a, "type", "veth", "peer", "name", &b])
            .status()
            .expect("ip link add");
        assert!(status.success(), "could not create veth pair {a}/{b}");
        Self { a, b }
    }
}

impl Drop for VethPair {
    fn drop(&mut self) {
        let _ = Command::new("ip").args(["link", "del", &self.a]).status();
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::new("nslink_core=debug"))
        .try_init();
}

fn skip() -> bool {
    if !check_privileges() {
        eprintln!("Skipping test: requires root/netns privileges");
        return true;
    }
    if !tool_available("iperf3") {
        eprintln!("Skipping test: iperf3 not installed");
        return true;
    }
    false
}

#[test]
fn veth_round_trip_restores_host() {
    if skip() {
        return;
    }
    init_tracing();
    let veth = VethPair::create();
    let dir = tempfile::tempdir().unwrap();
    let config = ConfigInput {
        link: LinkInput {
            src_if: Some(veth.a.clone()),
            dst_if: Some(veth.b.clone()),
            src_ip: Some("10.254.254.1/30".into()),
            dst_ip: Some("10.254.254.2/30".into()),
            ..Default::default()
        },
        test: TestInput {
            duration_s: Some(2),
            warmup_ms: Some(200),
            ..Default::default()
        },
        state: StateInput {
            dir: Some(dir.path().to_path_buf()),
            prefix: Some("nsltest".into()),
            ..Default::default()
        },
        ..Default::default()
    }
    .resolve()
    .unwrap();

    let backend = IpRoute2::new(config.settings.tools.clone(), false);
    let mut session = Session::new(Box::new(backend), config.clone(), CancelFlag::new());
    let report = session.execute().unwrap();
    println!("{report}");
    assert!(report.delta.tx > 0, "{report:?}");
    assert!(report.delta.rx > 0, "{report:?}");
    assert_eq!(report.exit_status, Some(0), "{}", report.raw_output);
    drop(session);

    let host = IpRoute2::new(config.settings.tools.clone(), false);
    for iface in [&veth.a, &veth.b] {
        let info = host
            .link(Domain::Root, iface)
            .unwrap()
            .unwrap_or_else(|| panic!("{iface} did not come back"));
        assert_eq!(info.admin_state(), AdminState::Down);
        assert!(!info.has_assigned_addr());
    }
    let leftover: Vec<String> = host
        .domains()
        .unwrap()
        .into_iter()
        .filter(|d| d.starts_with("nsltest-"))
        .collect();
    assert!(leftover.is_empty(), "{leftover:?}");
}
