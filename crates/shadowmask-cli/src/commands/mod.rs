//! Command implementations for the shadowmask CLI.

mod batch;
mod detect;
mod devices;

pub use batch::cmd_batch;
pub use detect::cmd_detect;
pub use devices::cmd_devices;
