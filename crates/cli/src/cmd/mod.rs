mod build;
mod index;
mod info;
mod publish;

pub use build::{BuildFlags, cmd_build};
pub use index::{History, cmd_index};
pub use info::cmd_info;
pub use publish::cmd_publish;
