pub mod backoff;
pub mod connection;
pub mod inspection;
pub mod loopback;
