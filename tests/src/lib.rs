//! End-to-end scenarios across the socket core's public surface.
//!
//! The per-module suites in `rill-stack` pin component behavior; the flows
//! here chain the application operations, the demultiplexer and the output
//! scheduler together the way a stack driver would.

#![cfg_attr(not(test), no_std)]

pub mod flow_tests;
