pub mod error;
pub mod processor;
#[allow(clippy::module_inception)]
pub mod runner;
