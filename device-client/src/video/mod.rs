pub mod annotation;
pub mod device;
pub mod errors;

pub use annotation::render_payload;
pub use device::{CameraDevice, Frame, SyntheticCamera};
pub use errors::{CaptureError, CaptureResult};
