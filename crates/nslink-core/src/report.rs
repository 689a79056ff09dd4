//! Test results, warnings, and their human/JSON renderings.

use std::fmt;

use serde::Serialize;

use crate::counters::{CounterDelta, CounterSnapshot};

/// Non-fatal findings. They never change the exit status.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    /// Benchmark client exited non-zero (iperf3/ping do so on loss).
    ClientExit { status: Option<i32> },
    /// The client could not be run at all.
    ClientFailed { detail: String },
    /// Source transmitted more than the destination received.
    PacketLoss { lost: u64, sent: u64 },
    CrcErrors { src: u64, dst: u64 },
    /// The tool itself reported loss.
    LossReported { percent: f64 },
    NoTraffic,
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::ClientExit { status: Some(code) } => {
                write!(f, "benchmark client exited with status {code}")
            }
            Warning::ClientExit { status: None } => write!(f, "benchmark client killed by a signal"),
            Warning::ClientFailed { detail } => write!(f, "benchmark client failed: {detail}"),
            Warning::PacketLoss { lost, sent } => {
                write!(f, "{lost} of {sent} transmitted packets not received")
            }
            Warning::CrcErrors { src, dst } => write!(f, "CRC errors: src {src}, dst {dst}"),
            Warning::LossReported { percent } => write!(f, "benchmark reported {percent:.2}% loss"),
            Warning::NoTraffic => write!(f, "no packets transmitted"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TestReport {
    pub mode: String,
    pub src_if: String,
    pub dst_if: String,
    pub src_domain: String,
    pub dst_domain: String,
    pub target: String,
    pub port: Option<u16>,
    pub duration_s: u64,
    pub before: CounterSnapshot,
    pub after: CounterSnapshot,
    pub delta: CounterDelta,
    pub jitter_ms: Option<f64>,
    pub loss_percent: Option<f64>,
    pub exit_status: Option<i32>,
    pub warnings: Vec<Warning>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub raw_output: String,
}

impl TestReport {
    /// Derive warnings from the measured values.
    pub fn assess(&mut self, client_failure: Option<String>) {
        let mut warnings = Vec::new();
        match client_failure {
            Some(detail) => warnings.push(Warning::ClientFailed { detail }),
            None if self.exit_status != Some(0) => warnings.push(Warning::ClientExit {
                status: self.exit_status,
            }),
            None => {}
        }
        if self.delta.tx == 0 {
            warnings.push(Warning::NoTraffic);
        } else if self.delta.lost() > 0 {
            warnings.push(Warning::PacketLoss {
                lost: self.delta.lost(),
                sent: self.delta.tx,
            });
        }
        if self.delta.crc_total() > 0 {
            warnings.push(Warning::CrcErrors {
                src: self.delta.crc_src,
                dst: self.delta.crc_dst,
            });
        }
        if let Some(percent) = self.loss_percent.filter(|p| *p > 0.0) {
            warnings.push(Warning::LossReported { percent });
        }
        self.warnings = warnings;
    }

    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    fn has(&self, pred: impl Fn(&Warning) -> bool) -> bool {
        self.warnings.iter().any(pred)
    }
}

fn marker(ok: bool) -> &'static str {
    if ok {
        "[ OK ]"
    } else {
        "[WARN]"
    }
}

fn opt(value: Option<f64>, unit: &str) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.3} {unit}"))
}

impl fmt::Display for TestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let port = self.port.map(|p| format!(":{p}")).unwrap_or_default();
        writeln!(
            f,
            "{} test, {}s: {}@{} -> {}@{} ({}{port})",
            self.mode, self.duration_s, self.src_if, self.src_domain, self.dst_if, self.dst_domain, self.target
        )?;
        writeln!(f, "  tx packets (src)    {}", self.delta.tx)?;
        writeln!(f, "  rx packets (dst)    {}", self.delta.rx)?;
        writeln!(f, "  crc errors src/dst  {} / {}", self.delta.crc_src, self.delta.crc_dst)?;
        writeln!(f, "  jitter              {}", opt(self.jitter_ms, "ms"))?;
        writeln!(f, "  reported loss       {}", opt(self.loss_percent, "%"))?;
        let status = self
            .exit_status
            .map_or_else(|| "none".to_string(), |s| s.to_string());
        writeln!(f, "  client exit status  {status}")?;

        let client_ok = !self.has(|w| matches!(w, Warning::ClientExit { .. } | Warning::ClientFailed { .. }));
        let loss_ok = !self.has(|w| {
            matches!(w, Warning::PacketLoss { .. } | Warning::LossReported { .. } | Warning::NoTraffic)
        });
        let crc_ok = !self.has(|w| matches!(w, Warning::CrcErrors { .. }));
        writeln!(f, "{} benchmark client", marker(client_ok))?;
        writeln!(f, "{} packet delivery", marker(loss_ok))?;
        writeln!(f, "{} CRC errors", marker(crc_ok))?;
        for w in &self.warnings {
            writeln!(f, "{}   {w}", marker(false))?;
        }
        Ok(())
    }
}
