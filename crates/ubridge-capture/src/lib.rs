pub mod bus;
pub mod error;
pub mod handlers;
pub mod types;

pub use bus::CaptureBus;
pub use error::{CaptureError, Result};
pub use handlers::{BusEvent, CaptureHandler, HandlerRegistry};
pub use types::{CaptureEvent, CaptureSession, CaptureStatus, InboundFrame, OutboundFrame, Topic};
