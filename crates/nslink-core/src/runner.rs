//! Test Runner: one benchmark round across a built topology.
//!
//! Ordering is load-bearing: counters are read only after the interfaces
//! live in their domains, the responder is confirmed alive before the
//! client starts, and it is stopped before the final counter read.

use std::fmt;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::backend::{CommandOutput, ManagedProcess, NetBackend};
use crate::config::{TestConfig, TestMode, ToolPaths};
use crate::counters::CounterSnapshot;
use crate::domain::Domain;
use crate::error::LinkError;
use crate::extract::extractor_for;
use crate::record::RunRecord;
use crate::report::TestReport;
use crate::session::CancelFlag;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStep {
    ResolveAddress,
    SnapshotBefore,
    Warmup,
    StartResponder,
    Client,
    StopResponder,
    SnapshotAfter,
}

impl fmt::Display for RunStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunStep::ResolveAddress => "resolve destination address",
            RunStep::SnapshotBefore => "read counters (before)",
            RunStep::Warmup => "warm-up",
            RunStep::StartResponder => "start responder",
            RunStep::Client => "run benchmark client",
            RunStep::StopResponder => "stop responder",
            RunStep::SnapshotAfter => "read counters (after)",
        })
    }
}

/// Responder process bound to the lifetime of one round. Dropping it
/// stops the process, so an early return cannot leak a server.
struct Responder {
    process: Option<Box<dyn ManagedProcess>>,
    grace: Duration,
}

impl Responder {
    fn start(
        backend: &dyn NetBackend,
        domain: &str,
        program: &str,
        port: u16,
        settle: Duration,
        grace: Duration,
    ) -> Result<Self, LinkError> {
        let args = vec!["-s".to_string(), "-p".to_string(), port.to_string()];
        let failed = |detail: String| LinkError::ResponderStart {
            program: program.to_string(),
            domain: domain.to_string(),
            detail,
        };
        let process = backend
            .spawn(domain, program, &args)
            .map_err(|e| failed(format!("{e:#}")))?;
        let mut responder = Self {
            process: Some(process),
            grace,
        };

        backend.pause(settle);
        if let Some(p) = responder.process.as_mut() {
            if !p.is_running() {
                let output = p.failure_output();
                let detail = match output.trim() {
                    "" => "exited immediately".to_string(),
                    text => text.to_string(),
                };
                // Already dead; nothing for Drop to stop.
                responder.process = None;
                return Err(failed(detail));
            }
            debug!(pid = p.pid(), domain, port, "responder listening");
        }
        Ok(responder)
    }

    /// Stop by PID: SIGTERM, then SIGKILL after the grace period.
    fn stop(&mut self) {
        let Some(mut process) = self.process.take() else {
            return;
        };
        let pid = process.pid();
        match process.terminate(self.grace) {
            Ok(status) => debug!(pid, ?status, "responder stopped"),
            Err(e) => warn!(pid, step = %RunStep::StopResponder, error = %e, "could not stop responder"),
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Build the benchmark client invocation for `mode`.
pub fn client_command(test: &TestConfig, tools: &ToolPaths, target: &str) -> (String, Vec<String>) {
    let secs = test.duration.as_secs().max(1).to_string();
    let mut args: Vec<String> = Vec::new();
    match &test.mode {
        TestMode::Flood => {
            args.extend(["-f".into(), "-w".into(), secs]);
            if let Some(size) = test.size {
                args.extend(["-s".into(), size.to_string()]);
            }
            args.push(target.to_string());
            (tools.ping.clone(), args)
        }
        mode => {
            args.extend([
                "-c".into(),
                target.to_string(),
                "-p".into(),
                test.port.to_string(),
                "-t".into(),
                secs,
            ]);
            if let Some(size) = test.size {
                args.extend(["-l".into(), size.to_string()]);
            }
            if let TestMode::Rate { bitrate } = mode {
                args.extend(["-u".into(), "-b".into(), bitrate.clone()]);
            }
            if test.json_output {
                args.push("-J".into());
            }
            (tools.iperf3.clone(), args)
        }
    }
}

/// The address the destination interface actually carries right now.
fn resolve_target(backend: &dyn NetBackend, record: &RunRecord) -> Result<String, LinkError> {
    let step = RunStep::ResolveAddress;
    let info = backend
        .link(Domain::Named(&record.dst_domain), &record.dst_if)
        .map_err(|e| LinkError::Measurement(format!("{step}: {e:#}")))?
        .ok_or_else(|| {
            LinkError::Measurement(format!(
                "{step}: interface '{}' not found in {}",
                record.dst_if, record.dst_domain
            ))
        })?;
    let addr = info.assigned_addrs().next().map(|a| a.network.ip().to_string());
    addr.ok_or_else(|| {
        LinkError::Measurement(format!(
            "{step}: no address assigned to '{}' in {}",
            record.dst_if, record.dst_domain
        ))
    })
}

/// Run one benchmark round. Only address resolution, responder start and
/// cancellation are errors; everything the client does ends up in the
/// report.
pub fn run(
    backend: &dyn NetBackend,
    record: &RunRecord,
    test: &TestConfig,
    tools: &ToolPaths,
    cancel: &CancelFlag,
) -> Result<TestReport, LinkError> {
    cancel.check()?;
    let target = resolve_target(backend, record)?;
    debug!(target = %target, "destination address resolved");

    let snapshot = || {
        CounterSnapshot::take(
            backend,
            &record.src_domain,
            &record.src_if,
            &record.dst_domain,
            &record.dst_if,
        )
    };
    let before = snapshot();

    if !test.warmup.is_zero() {
        debug!(ms = test.warmup.as_millis() as u64, step = %RunStep::Warmup, "waiting for link to settle");
        backend.pause(test.warmup);
    }
    cancel.check()?;

    let mut responder = if test.mode.needs_responder() {
        Some(Responder::start(
            backend,
            &record.dst_domain,
            &tools.iperf3,
            test.port,
            test.settle,
            test.stop_grace,
        )?)
    } else {
        backend.pause(test.settle);
        None
    };
    cancel.check()?;

    let (program, args) = client_command(test, tools, &target);
    info!(
        mode = test.mode.name(),
        target = %target,
        port = test.port,
        duration_s = test.duration.as_secs(),
        "starting benchmark"
    );
    let (output, client_failure) = match backend.exec(&record.src_domain, &program, &args) {
        Ok(out) => (out, None),
        Err(e) => {
            warn!(step = %RunStep::Client, error = %e, "benchmark client could not run");
            (
                CommandOutput {
                    status: None,
                    ..Default::default()
                },
                Some(format!("{e:#}")),
            )
        }
    };

    if let Some(r) = responder.as_mut() {
        r.stop();
    }
    // An interrupt also kills the client; its output is not a measurement.
    cancel.check()?;
    let after = snapshot();

    let raw = output.combined();
    let extractor = extractor_for(&test.mode, test.json_output);
    let mut report = TestReport {
        mode: test.mode.name().to_string(),
        src_if: record.src_if.clone(),
        dst_if: record.dst_if.clone(),
        src_domain: record.src_domain.clone(),
        dst_domain: record.dst_domain.clone(),
        target,
        port: test.mode.needs_responder().then_some(test.port),
        duration_s: test.duration.as_secs(),
        before,
        after,
        delta: before.delta(&after),
        jitter_ms: extractor.jitter_ms(&raw),
        loss_percent: extractor.loss_percent(&raw),
        exit_status: output.status,
        warnings: Vec::new(),
        raw_output: raw,
    };
    report.assess(client_failure);
    for w in &report.warnings {
        warn!(warning = %w, "measurement warning");
    }
    info!(
        tx = report.delta.tx,
        rx = report.delta.rx,
        crc = report.delta.crc_total(),
        "benchmark finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::domain::DomainNames;
    use crate::record::RecordStore;
    use crate::report::Warning;
    use crate::sim::{SimNet, SimOp};
    use crate::topology::{build, plan, BuildOptions};

    const PID: u32 = 4242;

    fn built(port: u16) -> (SimNet, RunRecord, tempfile::TempDir) {
        let sim = SimNet::new();
        sim.add_cabled_pair("eth1", "eth2");
        let link = LinkConfig {
            src_if: "eth1".into(),
            dst_if: "eth2".into(),
            src_addr: "10.10.10.1/30".parse().unwrap(),
            dst_addr: "10.10.10.2/30".parse().unwrap(),
            mtu: 1500,
        };
        let record = plan(&link, &DomainNames::for_pid("nslink", PID), PID, Some(port));
        let dir = tempfile::tempdir().unwrap();
        build(
            &sim,
            &record,
            &link,
            &BuildOptions::default(),
            &RecordStore::new(dir.path()),
            &CancelFlag::new(),
        )
        .unwrap();
        (sim, record, dir)
    }

    fn test_config(mode: TestMode) -> TestConfig {
        TestConfig {
            mode,
            duration: Duration::from_secs(10),
            size: Some(56),
            port: 50123,
            ..Default::default()
        }
    }

    fn go(sim: &SimNet, record: &RunRecord, test: &TestConfig) -> Result<TestReport, LinkError> {
        run(sim, record, test, &ToolPaths::default(), &CancelFlag::new())
    }

    #[test]
    fn throughput_round_reports_traffic() {
        let (sim, record, _dir) = built(50123);
        let report = go(&sim, &record, &test_config(TestMode::Throughput)).unwrap();

        assert!(report.delta.tx > 0);
        assert!(report.delta.rx > 0);
        assert_eq!(report.delta.crc_src, 0);
        assert_eq!(report.delta.crc_dst, 0);
        assert_eq!(report.exit_status, Some(0));
        assert_eq!(report.target, "10.10.10.2");
        assert!(report.is_clean(), "{:?}", report.warnings);
        assert!(sim.live_responders().is_empty());
    }

    #[test]
    fn responder_brackets_the_client() {
        let (sim, record, _dir) = built(50123);
        go(&sim, &record, &test_config(TestMode::Throughput)).unwrap();
        let ops = sim.ops();
        let pos = |needle: &str| ops.iter().position(|o| o.starts_with(needle)).unwrap();
        assert!(pos("spawn iperf3") < pos("iperf3 client"));
        assert!(pos("iperf3 client") < pos("terminate pid"));
        assert!(ops[pos("spawn iperf3")].ends_with("in nslink-4242-dst"));
    }

    #[test]
    fn rate_mode_extracts_jitter() {
        let (sim, record, _dir) = built(50123);
        let mode = TestMode::Rate {
            bitrate: "100M".into(),
        };
        let report = go(&sim, &record, &test_config(mode.clone())).unwrap();
        assert_eq!(report.jitter_ms, Some(0.042));
        assert_eq!(report.loss_percent, Some(0.0));

        let mut text = test_config(mode);
        text.json_output = false;
        let report = go(&sim, &record, &text).unwrap();
        assert_eq!(report.jitter_ms, Some(0.042));
    }

    #[test]
    fn lossy_link_is_a_warning() {
        let (sim, record, _dir) = built(50123);
        sim.set_loss_percent(5.0);
        let report = go(&sim, &record, &test_config(TestMode::Flood)).unwrap();
        assert_eq!(report.exit_status, Some(1));
        assert_eq!(report.port, None);
        assert!(report.warnings.contains(&Warning::ClientExit { status: Some(1) }));
        assert!(report
            .warnings
            .iter()
            .any(|w| matches!(w, Warning::PacketLoss { lost: 500, .. })));
        assert!(!sim.ops().iter().any(|o| o.starts_with("spawn")));
    }

    #[test]
    fn dead_responder_is_fatal_and_skips_client() {
        let (sim, record, _dir) = built(50123);
        sim.set_crash_responders(true);
        let err = go(&sim, &record, &test_config(TestMode::Throughput)).unwrap_err();
        match err {
            LinkError::ResponderStart { detail, domain, .. } => {
                assert!(detail.contains("Address already in use"), "{detail}");
                assert_eq!(domain, "nslink-4242-dst");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!sim.ops().iter().any(|o| o.starts_with("iperf3 client")));
    }

    #[test]
    fn client_failure_is_reported_and_responder_stopped() {
        let (sim, record, _dir) = built(50123);
        sim.fail_once(SimOp::Exec, None);
        let report = go(&sim, &record, &test_config(TestMode::Throughput)).unwrap();
        assert!(matches!(report.warnings[0], Warning::ClientFailed { .. }));
        assert_eq!(report.exit_status, None);
        assert!(sim.live_responders().is_empty());
    }

    #[test]
    fn missing_destination_address_aborts() {
        let (sim, record, _dir) = built(50123);
        sim.flush_addrs(Domain::Named("nslink-4242-dst"), "eth2").unwrap();
        let err = go(&sim, &record, &test_config(TestMode::Throughput)).unwrap_err();
        assert!(matches!(err, LinkError::Measurement(_)));
        assert!(!sim.ops().iter().any(|o| o.starts_with("spawn")));
    }

    #[test]
    fn cancelled_round_runs_nothing() {
        let (sim, record, _dir) = built(50123);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let test = test_config(TestMode::Throughput);
        let err = run(&sim, &record, &test, &ToolPaths::default(), &cancel).unwrap_err();
        assert!(matches!(err, LinkError::Interrupted));
        assert!(sim.live_responders().is_empty());
        assert!(!sim.ops().iter().any(|o| o.starts_with("spawn")));
    }

    #[test]
    fn dropped_responder_is_stopped() {
        let (sim, _record, _dir) = built(50123);
        let responder = Responder::start(
            &sim,
            "nslink-4242-dst",
            "iperf3",
            6000,
            Duration::ZERO,
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(sim.live_responders().len(), 1);
        drop(responder);
        assert!(sim.live_responders().is_empty());
    }

    #[test]
    fn client_arguments_follow_mode() {
        let tools = ToolPaths::default();
        let mut test = test_config(TestMode::Rate {
            bitrate: "10M".into(),
        });
        let (prog, args) = client_command(&test, &tools, "10.0.0.2");
        assert_eq!(prog, "iperf3");
        assert_eq!(
            args.join(" "),
            "-c 10.0.0.2 -p 50123 -t 10 -l 56 -u -b 10M -J"
        );

        test.mode = TestMode::Flood;
        let (prog, args) = client_command(&test, &tools, "10.0.0.2");
        assert_eq!(prog, "ping");
        assert_eq!(args.join(" "), "-f -w 10 -s 56 10.0.0.2");
    }

    #[test]
    fn interrupt_during_client_is_not_a_result() {
        let (sim, record, _dir) = built(50123);
        let cancel = CancelFlag::new();
        sim.interrupt_next_client(&cancel);
        let test = test_config(TestMode::Throughput);
        let err = run(&sim, &record, &test, &ToolPaths::default(), &cancel).unwrap_err();
        assert!(matches!(err, LinkError::Interrupted));
        assert!(sim.live_responders().is_empty());
        let ops = sim.ops();
        assert!(ops.iter().any(|o| o == "iperf3 client interrupted"), "{ops:?}");
    }
}
