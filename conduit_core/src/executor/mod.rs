//! Connector execution.
//!
//! A connector is "an external unit of execution exchanging line-delimited
//! typed messages". `ConnectorLauncher` hides how it is brought up (local
//! process, container, in-process adapter); `ConnectorExecutor` drives the
//! SPEC/CHECK/DISCOVER/READ operations on top of any launcher.

pub mod in_process;
pub mod launcher;
pub mod ring;
pub mod runner;
pub mod subprocess;

pub use in_process::{AdapterContext, InProcessConnector, InProcessLauncher};
pub use launcher::{ConnectorLauncher, Invocation, LaunchedProcess, OutputLine, ProcessControl};
pub use runner::{ConnectorExecutor, ReadStream};
pub use subprocess::SubprocessLauncher;
