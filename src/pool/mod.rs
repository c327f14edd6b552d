mod child;
mod pool;
mod supervisor;

pub use child::*;
pub use pool::*;
pub use supervisor::*;

/// Hidden argv[1] that turns this binary into the worker pool process.
pub const POOL_SUBCOMMAND: &str = "pool";

/// Hidden argv[1] that turns this binary into a single worker child.
pub const EXEC_SUBCOMMAND: &str = "exec";
