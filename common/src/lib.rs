pub mod types;
pub mod protocol;
pub mod error;
pub mod model;
pub mod transport;
pub mod wire;

pub use types::*;
pub use protocol::*;
pub use error::*;
