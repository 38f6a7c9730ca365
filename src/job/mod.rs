#[allow(clippy::module_inception)]
pub mod job;
pub mod queue;
