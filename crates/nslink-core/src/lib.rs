//! Point-to-point link testing over Linux network namespaces.
//!
//! Two physical interfaces are moved out of the default namespace into a
//! private namespace each, addressed as a /30, and exercised with a
//! benchmark tool; the host is then restored. The flow is:
//!
//! [`guard`] validates → [`topology`] acquires and records →
//! [`runner`] measures → [`teardown`] reverses.
//!
//! [`session::Session`] ties these into a state machine whose drop
//! guarantees teardown. All kernel and process access goes through
//! [`backend::NetBackend`], implemented for real hosts by
//! [`iproute::IpRoute2`] and in memory by [`sim::SimNet`].

pub mod backend;
pub mod config;
pub mod counters;
pub mod detect;
pub mod domain;
pub mod error;
pub mod extract;
pub mod guard;
pub mod iproute;
pub mod record;
pub mod report;
pub mod runner;
pub mod session;
pub mod sim;
pub mod teardown;
pub mod topology;

pub mod test_util;

pub use config::{Config, ConfigInput, LinkConfig, TestConfig, TestMode};
pub use error::{ErrorKind, GuardError, LinkError};
pub use report::{TestReport, Warning};
pub use session::{CancelFlag, Phase, Session};
