//! The three modes of the binary: run a test, clean up, detect.

use std::fs;
use std::time::Duration;

use anyhow::{Context, Result};
use nslink_core::backend::NetBackend;
use nslink_core::config::{ConfigInput, Settings};
use nslink_core::detect;
use nslink_core::domain::running_as_root;
use nslink_core::iproute::IpRoute2;
use nslink_core::record::RecordStore;
use nslink_core::sim::SimNet;
use nslink_core::teardown::{cleanup_pid, cleanup_stale, sweep_orphans, TeardownReport};
use nslink_core::{CancelFlag, LinkError, Session};
use tracing::info;

use crate::Cli;

pub fn dispatch(cli: &Cli, cancel: &CancelFlag) -> Result<()> {
    if cli.cleanup {
        cmd_cleanup(cli)
    } else if cli.detect {
        cmd_detect(cli)
    } else {
        cmd_run(cli, cancel)
    }
}

/// Config file (if any) with the command-line flags layered on top.
fn load_input(cli: &Cli) -> Result<ConfigInput> {
    let file = match &cli.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            ConfigInput::from_toml_str(&text)?
        }
        None => ConfigInput::default(),
    };
    Ok(file.overlay(flags_input(cli)))
}

/// Only flags the operator actually passed are set, so they never mask
/// file values with defaults.
fn flags_input(cli: &Cli) -> ConfigInput {
    let set = |flag: bool| flag.then_some(true);
    let mut input = ConfigInput::default();

    input.link.src_if = cli.src_if.clone();
    input.link.dst_if = cli.dst_if.clone();
    input.link.src_ip = cli.src_ip.clone();
    input.link.dst_ip = cli.dst_ip.clone();
    input.link.mtu = cli.mtu;
    input.link.auto = set(cli.auto);

    input.test.mode = if cli.flood {
        Some("flood".into())
    } else if cli.udp {
        Some("rate".into())
    } else {
        None
    };
    input.test.bitrate = cli.rate.clone();
    input.test.duration_s = cli.duration;
    input.test.size = cli.size;
    input.test.port = cli.port;
    input.test.warmup_ms = cli.warmup;
    input.test.json_output = cli.text_output.then_some(false);

    input.guard.accept_unknown = set(cli.accept_unknown);
    input.guard.require_carrier = set(cli.require_carrier);

    input.state.dir = cli.state_dir.clone();
    input.state.prefix = cli.prefix.clone();
    input.state.keep = set(cli.keep);

    input.tools.sudo = set(cli.sudo);
    input
}

fn backend_for(cli: &Cli, settings: &Settings) -> Box<dyn NetBackend> {
    if cli.simulate {
        info!("using simulated host");
        Box::new(SimNet::simulated_host())
    } else {
        Box::new(IpRoute2::new(settings.tools.clone(), settings.use_sudo))
    }
}

fn require_root(cli: &Cli, settings: &Settings) -> Result<(), LinkError> {
    if cli.simulate || settings.use_sudo || running_as_root() {
        Ok(())
    } else {
        Err(LinkError::NotRoot)
    }
}

fn cmd_run(cli: &Cli, cancel: &CancelFlag) -> Result<()> {
    let config = load_input(cli)?.resolve()?;
    require_root(cli, &config.settings)?;
    let backend = backend_for(cli, &config.settings);

    let mut session = Session::new(backend, config, cancel.clone());
    let mut report = session.execute()?;
    if !cli.show_output {
        report.raw_output.clear();
    }

    if cli.json {
        println!("{}", report.to_json().context("failed to serialize report")?);
    } else {
        print!("{report}");
        if cli.show_output && !report.raw_output.is_empty() {
            println!("\n--- benchmark output ---\n{}", report.raw_output.trim_end());
        }
    }
    if let Some(record) = session.record() {
        println!(
            "topology kept in {} / {}; restore with: nslink --cleanup --pid {}",
            record.src_domain, record.dst_domain, record.pid
        );
    }
    Ok(())
}

fn cmd_cleanup(cli: &Cli) -> Result<()> {
    let settings = load_input(cli)?.resolve_settings()?;
    require_root(cli, &settings)?;
    let backend = backend_for(cli, &settings);
    let store = RecordStore::new(&settings.state_dir);

    let report = match cli.pid {
        Some(pid) => cleanup_pid(backend.as_ref(), &store, &settings.prefix, pid),
        None => {
            let mut report = cleanup_stale(backend.as_ref(), &store);
            report.merge(sweep_orphans(backend.as_ref(), &settings.prefix, &store));
            report
        }
    };
    print!("{}", render_cleanup(&report));
    Ok(())
}

fn render_cleanup(report: &TeardownReport) -> String {
    if report.is_noop() && report.is_clean() {
        return "nothing to clean up\n".into();
    }
    let mut out = String::new();
    if !report.restored.is_empty() {
        out.push_str(&format!("restored interfaces: {}\n", report.restored.join(", ")));
    }
    if !report.deleted_domains.is_empty() {
        out.push_str(&format!("deleted namespaces:  {}\n", report.deleted_domains.join(", ")));
    }
    if !report.removed_records.is_empty() {
        let pids: Vec<String> = report.removed_records.iter().map(u32::to_string).collect();
        out.push_str(&format!("removed run records: {}\n", pids.join(", ")));
    }
    for issue in &report.issues {
        out.push_str(&format!("[WARN] {issue}\n"));
    }
    out
}

fn cmd_detect(cli: &Cli) -> Result<()> {
    let settings = load_input(cli)?.resolve_settings()?;
    if cli.blink.is_some() {
        // LED control writes to sysfs.
        require_root(cli, &settings)?;
    }
    let backend = backend_for(cli, &settings);
    let candidates = detect::survey(backend.as_ref())?;

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&candidates).context("failed to serialize candidates")?
        );
    } else {
        print!("{}", detect::render_table(&candidates));
    }

    if let Some(secs) = cli.blink {
        let blinked = detect::blink(backend.as_ref(), &candidates, Duration::from_secs(secs));
        if blinked.is_empty() {
            eprintln!("no candidate supports LED identification");
        } else {
            eprintln!("blinked: {}", blinked.join(", "));
        }
    }
    Ok(())
}
