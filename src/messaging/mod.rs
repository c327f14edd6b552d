mod messages;
mod task;
mod task_id;

pub use messages::*;
pub use task::*;
pub use task_id::*;
