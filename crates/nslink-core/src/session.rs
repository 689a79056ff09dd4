//! One link test as an explicit state machine.
//!
//! ```text
//! Unbuilt --build--> Acquiring --ok--> Built --run--> Tested
//!    ^                   |               |              |
//!    +----- teardown ----+---------------+--------------+--> TornDown
//! ```
//!
//! A [`Session`] owns the topology it builds: dropping it tears the
//! topology down on every exit path unless the operator asked to keep it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backend::NetBackend;
use crate::config::{Config, LinkConfig, Selection};
use crate::domain::DomainNames;
use crate::error::LinkError;
use crate::guard;
use crate::record::{RecordStore, RunRecord};
use crate::report::TestReport;
use crate::runner;
use crate::teardown::{self, TeardownReport};
use crate::topology::{self, BuildOptions};

/// Set from a signal handler, polled between steps.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), LinkError> {
        if self.is_cancelled() {
            Err(LinkError::Interrupted)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unbuilt,
    /// Topology steps in progress; anything may exist.
    Acquiring,
    Built,
    Tested,
    TornDown,
}

impl Phase {
    /// Whether host state may currently differ from before `build`.
    pub fn holds_topology(self) -> bool {
        matches!(self, Phase::Acquiring | Phase::Built | Phase::Tested)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Unbuilt => "unbuilt",
            Phase::Acquiring => "acquiring",
            Phase::Built => "built",
            Phase::Tested => "tested",
            Phase::TornDown => "torn down",
        })
    }
}

pub struct Session {
    backend: Box<dyn NetBackend>,
    config: Config,
    store: RecordStore,
    pid: u32,
    phase: Phase,
    record: Option<RunRecord>,
    keep: bool,
    cancel: CancelFlag,
}

impl Session {
    pub fn new(backend: Box<dyn NetBackend>, config: Config, cancel: CancelFlag) -> Self {
        let store = RecordStore::new(config.settings.state_dir.clone());
        let keep = config.settings.keep;
        Self {
            backend,
            config,
            store,
            pid: std::process::id(),
            phase: Phase::Unbuilt,
            record: None,
            keep,
            cancel,
        }
    }

    /// Name the run after `pid` instead of the current process.
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn record(&self) -> Option<&RunRecord> {
        self.record.as_ref()
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn backend(&self) -> &dyn NetBackend {
        self.backend.as_ref()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Retain the topology when the session ends.
    pub fn set_keep(&mut self, keep: bool) {
        self.keep = keep;
    }

    fn refuse(&self, op: &'static str) -> LinkError {
        LinkError::InvalidTransition {
            op,
            phase: self.phase.to_string(),
        }
    }

    /// Resolve the configured selection to concrete interfaces.
    pub fn select(&self) -> Result<LinkConfig, LinkError> {
        match &self.config.selection {
            Selection::Explicit { src_if, dst_if } => self.config.link_for(src_if, dst_if),
            Selection::Auto => {
                let (src, dst) = guard::auto_select(self.backend())?;
                info!(src = %src, dst = %dst, "auto-selected interfaces");
                self.config.link_for(&src, &dst)
            }
        }
    }

    /// Refuse interfaces that a dead run still claims; mention the rest.
    fn check_stale(&self, link: &LinkConfig) -> Result<(), LinkError> {
        for stale in self.store.stale()? {
            if let Some(iface) = [&link.src_if, &link.dst_if]
                .into_iter()
                .find(|i| stale.involves(i))
            {
                return Err(LinkError::StaleRun {
                    iface: iface.clone(),
                    pid: stale.pid,
                    src_domain: stale.src_domain,
                    dst_domain: stale.dst_domain,
                });
            }
            warn!(
                pid = stale.pid,
                src_if = %stale.src_if,
                dst_if = %stale.dst_if,
                "stale run record found (nslink --cleanup restores it)"
            );
        }
        Ok(())
    }

    /// Validate both interfaces and build the topology. Precondition
    /// failures leave the host untouched; acquisition failures are rolled
    /// back before returning.
    pub fn build(&mut self, link: &LinkConfig) -> Result<&RunRecord, LinkError> {
        if !matches!(self.phase, Phase::Unbuilt | Phase::TornDown) {
            return Err(self.refuse("build"));
        }
        self.cancel.check()?;
        self.check_stale(link)?;
        for iface in [&link.src_if, &link.dst_if] {
            guard::validate(self.backend(), iface, &self.config.guard)?;
        }

        let names = DomainNames::for_pid(&self.config.settings.prefix, self.pid);
        let test = &self.config.test;
        let record = topology::plan(link, &names, self.pid, test.mode.needs_responder().then_some(test.port));
        let opts = BuildOptions {
            require_carrier: self.config.guard.require_carrier,
            carrier_wait: test.carrier_wait,
        };

        self.record = Some(record.clone());
        self.phase = Phase::Acquiring;
        info!(src = %names.src, dst = %names.dst, "building topology");
        if let Err(e) = topology::build(self.backend(), &record, link, &opts, &self.store, &self.cancel) {
            warn!(error = %e, "topology build failed, rolling back");
            self.teardown();
            return Err(e);
        }
        self.phase = Phase::Built;
        Ok(self.record.get_or_insert(record))
    }

    /// Run one benchmark round. A fatal runner error tears the topology
    /// down unless it is being kept.
    pub fn run(&mut self) -> Result<TestReport, LinkError> {
        if !matches!(self.phase, Phase::Built | Phase::Tested) {
            return Err(self.refuse("run"));
        }
        let Some(record) = self.record.clone() else {
            return Err(self.refuse("run"));
        };
        let result = runner::run(
            self.backend(),
            &record,
            &self.config.test,
            &self.config.settings.tools,
            &self.cancel,
        );
        match result {
            Ok(report) => {
                self.phase = Phase::Tested;
                Ok(report)
            }
            Err(e) => {
                if !self.keep {
                    self.teardown();
                }
                Err(e)
            }
        }
    }

    /// Undo whatever this session built. Allowed from every phase and
    /// idempotent.
    pub fn teardown(&mut self) -> TeardownReport {
        let report = match self.record.take() {
            Some(record) => teardown::teardown(self.backend(), &record, &self.store),
            None => {
                debug!(phase = %self.phase, "nothing to tear down");
                TeardownReport::default()
            }
        };
        if self.phase != Phase::Unbuilt {
            self.phase = Phase::TornDown;
        }
        report
    }

    /// Select, build, run once, and tear down (unless kept).
    pub fn execute(&mut self) -> Result<TestReport, LinkError> {
        let link = self.select()?;
        self.build(&link)?;
        let report = self.run()?;
        if !self.keep {
            let td = self.teardown();
            if !td.is_clean() {
                warn!(issues = td.issues.len(), "teardown finished with issues");
            }
        }
        Ok(report)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.phase.holds_topology() {
            return;
        }
        if self.keep {
            info!(
                pid = self.pid,
                "topology kept for inspection; restore with: nslink --cleanup --pid {}",
                self.pid
            );
            return;
        }
        self.teardown();
    }
}
