//! Counter Probe: best-effort packet/error counters read inside a domain.

use serde::Serialize;
use tracing::debug;

use crate::backend::{NetBackend, Stat};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InterfaceCounters {
    pub tx_packets: u64,
    pub rx_packets: u64,
    pub crc_errors: u64,
}

/// Read all counters for `iface` inside `domain`. Unreadable values are 0.
pub fn read_counters(backend: &dyn NetBackend, domain: &str, iface: &str) -> InterfaceCounters {
    let read = |stat: Stat| match backend.read_stat(domain, iface, stat) {
        Ok(v) => v,
        Err(e) => {
            debug!(domain, iface, stat = stat.file_name(), error = %e, "counter unreadable, using 0");
            0
        }
    };
    InterfaceCounters {
        tx_packets: read(Stat::TxPackets),
        rx_packets: read(Stat::RxPackets),
        crc_errors: read(Stat::RxCrcErrors),
    }
}

/// Both ends of the link at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub src: InterfaceCounters,
    pub dst: InterfaceCounters,
}

impl CounterSnapshot {
    pub fn take(
        backend: &dyn NetBackend,
        src_domain: &str,
        src_if: &str,
        dst_domain: &str,
        dst_if: &str,
    ) -> Self {
        Self {
            src: read_counters(backend, src_domain, src_if),
            dst: read_counters(backend, dst_domain, dst_if),
        }
    }

    /// `later - self`, clamped at zero if a counter went backwards.
    pub fn delta(&self, later: &CounterSnapshot) -> CounterDelta {
        CounterDelta {
            tx: later.src.tx_packets.saturating_sub(self.src.tx_packets),
            rx: later.dst.rx_packets.saturating_sub(self.dst.rx_packets),
            crc_src: later.src.crc_errors.saturating_sub(self.src.crc_errors),
            crc_dst: later.dst.crc_errors.saturating_sub(self.dst.crc_errors),
        }
    }
}

/// Traffic observed between two snapshots: packets sent by the source,
/// packets received by the destination, and CRC errors on each side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterDelta {
    pub tx: u64,
    pub rx: u64,
    pub crc_src: u64,
    pub crc_dst: u64,
}

impl CounterDelta {
    pub fn crc_total(&self) -> u64 {
        self.crc_src + self.crc_dst
    }

    /// Packets sent that never arrived; zero when the receiver saw more
    /// (background traffic such as neighbour discovery).
    pub fn lost(&self) -> u64 {
        self.tx.saturating_sub(self.rx)
    }
}
