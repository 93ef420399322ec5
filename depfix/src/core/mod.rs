//! Deterministic, pure logic shared by the remediation loop.
//!
//! Core modules must be free of I/O side effects. They operate on manifest text
//! and in-memory records and return deterministic outputs suitable for tests.

pub mod classifier;
pub mod feedback;
pub mod patcher;
pub mod requirement;
pub mod rules;
pub mod session;
pub mod types;
pub mod version;
