pub mod cancel;
pub mod checker;
pub mod config;
pub mod index;
pub mod prune;
pub mod repair;
pub mod repo;
pub mod snapshot;
pub mod tree;

pub use baler_types::error::{BalerError, Result};

#[cfg(test)]
mod tests;
#[cfg(test)]
mod testutil;
