pub mod connection;
pub mod listener;

pub use connection::*;
pub use listener::*;
