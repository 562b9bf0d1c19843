pub mod blobs;
pub mod cleanup;
pub mod maps;
pub mod mounts;
pub mod programs;
pub mod setup;

pub use blobs::*;
pub use cleanup::*;
pub use maps::*;
pub use mounts::*;
pub use programs::*;
pub use setup::*;

// Kernel-program backend: program loading, bpffs mounts and pinned maps
