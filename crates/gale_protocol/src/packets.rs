//! The packets the proxy inspects, grouped by protocol stage.
//!
//! Everything else on the wire is carried as an opaque
//! [`PacketFrame`](crate::PacketFrame) and forwarded verbatim.

pub mod config;
pub mod handshake;
pub mod login;
pub mod play;
pub mod status;

pub use config::*;
pub use handshake::*;
pub use login::*;
pub use play::*;
pub use status::*;
