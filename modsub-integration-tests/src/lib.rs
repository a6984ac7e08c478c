//! Integration tests for the modsub pipeline.
//!
//! This crate verifies the interaction between the core pipeline and the
//! in-memory adapters: commands appending events, the consumer applying
//! them, and queries observing the projection catch up.

// This is a test-only crate
#![cfg(test)]
