pub mod link;
pub mod sandbox;

pub use link::*;
pub use sandbox::*;

// Namespace isolation and netlink helpers used by the interception engine
