//! Cross-crate tests for the kill-switch control plane
//!
//! Covers the authority side (key shares, approval collection, issuance)
//! against one or more receiving platforms sharing a manual clock.

pub mod test_utils;

#[cfg(test)]
mod scenario_tests;

#[cfg(test)]
mod concurrency_tests;

#[cfg(test)]
mod audit_tests;
