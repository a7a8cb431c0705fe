pub mod devices;
pub mod error;
pub mod store;
pub mod types;

pub use devices::DeviceRegistry;
pub use error::{Result, SessionError};
pub use store::{SessionSlot, SessionStore};
pub use types::{Capabilities, Device, DeviceType, Session, SessionStatus};
