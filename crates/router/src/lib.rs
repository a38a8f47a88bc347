pub mod multiplexer;
pub mod server;
pub mod session;

pub use multiplexer::SessionMultiplexer;
