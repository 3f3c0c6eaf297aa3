pub mod config;
pub mod frame;
pub mod latch;
pub mod message;

pub use config::TunnelConfig;
pub use frame::{decode_binary_frame, encode_binary_frame, FrameError, ID_LEN};
pub use message::{FrameType, Message};
