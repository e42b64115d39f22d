//! Testing utilities and mock implementations
//!
//! Mocks for exercising the device session without a broker.

pub mod mocks;

pub use mocks::*;
