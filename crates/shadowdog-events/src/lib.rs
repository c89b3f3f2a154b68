//! Event taxonomy and synchronous dispatch bus shared by every
//! shadowdog component.

mod bus;
mod event;

pub use bus::EventBus;
pub use event::{ChangeKind, Emission, ShadowdogEvent};
