mod manager;

pub use manager::FrameHub;
