pub mod bucket;
#[allow(clippy::module_inception)]
pub mod message;
pub mod parameters;
pub mod routing;
