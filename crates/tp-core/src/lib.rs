pub mod config;
pub mod consts;
pub mod error;
pub mod exec;
pub mod executables;
pub mod initialized;
pub mod logger;
pub mod parse;

pub use config::*;
pub use consts::*;
pub use error::*;
pub use exec::*;
pub use executables::*;
pub use initialized::*;
pub use logger::*;
pub use parse::*;

// Configuration, executable resolution and process plumbing shared by the backends
