mod channel;

pub use channel::{connect_with_retry, ControlChannel, EventHandler, ReconnectPolicy};
