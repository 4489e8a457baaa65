//! Integration test entry point for meridian-node.
//!
//! Nodes run in-process: each serves its HTTP API on a loopback port and
//! replicates over the in-memory network.
//!
//! Run with: cargo test --test integration -- --test-threads=1

mod harness;
mod catchup;
mod failover;
mod membership;
mod replication;
