//! Verified remediation of vulnerable dependency declarations.
//!
//! One finding at a time, depfix patches the vulnerable package in its
//! manifest, installs the candidate in a disposable environment, and refines
//! the edit with compatibility rules (or an advisory oracle) until it installs
//! or the attempt budget runs out.
//!
//! - **[`core`]**: Pure, deterministic logic (patching, rules, classification,
//!   session state machine). No I/O.
//! - **[`io`]**: Side-effecting adapters (config, installers, registry, oracle,
//!   artifacts). Isolated behind traits so tests can script them.
//!
//! Orchestration modules ([`coordinate`], [`validate`], [`remediate`]) combine
//! the two to implement CLI commands.

pub mod coordinate;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod remediate;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod validate;
