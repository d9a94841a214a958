pub mod capture;
pub mod producer;
pub mod queue;
pub mod relay;

pub use capture::run_producer;
pub use producer::{ProcessLauncher, ProducerExit, ProducerHandle, ProducerLauncher};
pub use queue::FrameQueue;
pub use relay::{FrameSink, RelayPump, RelayStats};
