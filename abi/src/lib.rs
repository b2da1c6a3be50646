//! rill embedder-facing ABI types.
//!
//! This crate provides the canonical constants and layouts shared between the
//! socket core and the systems embedding it. Having a single source of truth
//! eliminates:
//! - Duplicate constant definitions between the stack and embedder glue
//! - Mismatched errno/ICMP code tables at the C boundary
//!
//! All layout-bearing types in this crate are `#[repr(C)]` for ABI stability.

#![no_std]
#![forbid(unsafe_code)]

pub mod net;
