pub mod builder;
pub mod chain;
pub mod cleanup;
pub mod parameters;
pub mod restore;
pub mod rules;
pub mod save;
pub mod setup;
pub mod table;

pub use builder::*;
pub use chain::*;
pub use cleanup::*;
pub use parameters::*;
pub use restore::*;
pub use rules::*;
pub use save::*;
pub use setup::*;
pub use table::*;

// Rule model, policy builders and the restore-based apply and cleanup paths
