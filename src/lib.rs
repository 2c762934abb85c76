//! Browser-driven renewal of a hosted service.
//!
//! The crate loads a [`config::RunConfig`], opens a cookie-seeded browser
//! session, and walks the dashboard through renew, invoice creation and an
//! optional payment. Every irreversible step is guarded by a fresh
//! restriction check and the payment gate; operators hear about every
//! terminal outcome through the [`notifier`].

pub mod amount;
pub mod browser;
pub mod config;
pub mod dom_scripts;
pub mod gate;
pub mod locator;
pub mod logging;
pub mod markup;
pub mod metrics;
pub mod notifier;
pub mod orchestrator;
pub mod restriction;
pub mod runtime;
pub mod session;

pub use browser::{BrowserRuntime, BrowserRuntimeError};
pub use config::{RunConfig, RunConfigOverrides, RunIntent};
pub use orchestrator::{RenewalOrchestrator, RunOutcome, Terminal};
pub use runtime::ChromiumoxideRuntime;
