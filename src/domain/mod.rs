//! Domain layer - Core value types and port definitions
//!
//! This module defines the traits (ports) that adapters implement, so the
//! reconcilers can run against the real cluster or against test fakes.

pub mod ports;

pub use ports::*;
