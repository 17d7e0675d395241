pub mod hub;
pub mod messages;

pub use hub::{ClientMessage, ReloadHub};
pub use messages::{ReloadEvent, ReloadTrigger};
