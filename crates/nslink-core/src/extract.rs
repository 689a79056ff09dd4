//! Best-effort metrics from benchmark output.
//!
//! Every extractor returns `None` when the value is absent or the format
//! is not recognised; nothing here can fail a test.

use serde_json::Value;

use crate::config::TestMode;

pub trait MetricExtractor {
    fn jitter_ms(&self, output: &str) -> Option<f64>;
    fn loss_percent(&self, output: &str) -> Option<f64>;
}

/// `iperf3 -J`. Falls back to [`Iperf3Text`] when the output is not JSON
/// (old iperf3 builds ignore `-J` for some errors).
#[derive(Debug, Clone, Copy, Default)]
pub struct Iperf3Json;

/// iperf3's human report; reads the `receiver` summary line.
#[derive(Debug, Clone, Copy, Default)]
pub struct Iperf3Text;

/// `ping` summary: `N packets transmitted, M received, X% packet loss`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PingText;

pub fn extractor_for(mode: &TestMode, json_output: bool) -> Box<dyn MetricExtractor> {
    match mode {
        TestMode::Flood => Box::new(PingText),
        _ if json_output => Box::new(Iperf3Json),
        _ => Box::new(Iperf3Text),
    }
}

fn json_sum(output: &str) -> Option<Value> {
    let start = output.find('{')?;
    let doc: Value = serde_json::from_str(output[start..].trim_end()).ok()?;
    doc.get("end")?.get("sum").cloned()
}

fn is_json(output: &str) -> bool {
    output.trim_start().starts_with('{')
}

impl MetricExtractor for Iperf3Json {
    fn jitter_ms(&self, output: &str) -> Option<f64> {
        if !is_json(output) {
            return Iperf3Text.jitter_ms(output);
        }
        json_sum(output)?.get("jitter_ms")?.as_f64()
    }

    fn loss_percent(&self, output: &str) -> Option<f64> {
        if !is_json(output) {
            return Iperf3Text.loss_percent(output);
        }
        json_sum(output)?.get("lost_percent")?.as_f64()
    }
}

/// The last line iperf3 tagged `receiver`, else the last line that looks
/// like a UDP summary.
fn receiver_line(output: &str) -> Option<&str> {
    output
        .lines()
        .rev()
        .find(|l| l.trim_end().ends_with("receiver"))
        .or_else(|| {
            output
                .lines()
                .rev()
                .find(|l| l.contains(" ms ") && l.contains("%)"))
        })
}

impl MetricExtractor for Iperf3Text {
    fn jitter_ms(&self, output: &str) -> Option<f64> {
        let tokens: Vec<&str> = receiver_line(output)?.split_whitespace().collect();
        let ms = tokens.iter().position(|t| *t == "ms")?;
        tokens.get(ms.checked_sub(1)?)?.parse().ok()
    }

    fn loss_percent(&self, output: &str) -> Option<f64> {
        receiver_line(output)?
            .split_whitespace()
            .find(|t| t.starts_with('(') && t.ends_with("%)"))?
            .trim_start_matches('(')
            .trim_end_matches("%)")
            .parse()
            .ok()
    }
}

impl MetricExtractor for PingText {
    /// `mdev` from `rtt min/avg/max/mdev = 0.011/0.020/0.153/0.006 ms`.
    fn jitter_ms(&self, output: &str) -> Option<f64> {
        let line = output.lines().find(|l| l.contains("min/avg/max/mdev"))?;
        let values = line.split('=').nth(1)?.split_whitespace().next()?;
        values.split('/').nth(3)?.parse().ok()
    }

    fn loss_percent(&self, output: &str) -> Option<f64> {
        output
            .lines()
            .find(|l| l.contains("packet loss"))?
            .split(',')
            .find(|part| part.contains("packet loss"))?
            .split_whitespace()
            .next()?
            .trim_end_matches('%')
            .parse()
            .ok()
    }
}
