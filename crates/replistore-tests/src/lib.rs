//! Replistore test infrastructure
//!
//! An in-process harness that runs a coordinator and several storage replicas over
//! localhost TCP, plus multi-node scenarios for replication, membership and catch-up.

pub mod harness;

#[cfg(test)]
mod membership_tests;
#[cfg(test)]
mod proptest_address;

pub use harness::{eventually, init_tracing, tree_contents, TestCluster, TestEnv};
