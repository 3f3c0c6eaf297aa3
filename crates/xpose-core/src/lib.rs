pub mod access;
pub mod config;
pub mod constants;
pub mod error;
pub mod ids;
pub mod model;
pub mod portdiscovery;
pub mod resume;

pub use error::{Result, XposeError};
