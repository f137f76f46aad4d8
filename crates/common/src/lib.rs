//! Error plumbing shared by the cadence crates.

pub mod error;

pub use error::FromMessage;
