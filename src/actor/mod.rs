#[allow(clippy::module_inception)]
pub mod actor;
pub mod converter;
pub mod error;
pub mod retry;
