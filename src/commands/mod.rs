pub mod local;
pub mod parent;
pub mod utils;

pub use parent::run_parent_command;
