//! Hardware abstraction
//!
//! Capability traits consumed by the workers, plus simulated instruments.

pub mod capabilities;
pub mod mock;

pub use capabilities::{Actuatable, Connectable, Measurable};
