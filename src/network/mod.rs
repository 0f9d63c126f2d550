//! Network layer
//!
//! Framed TCP transports: the server-to-server group transport and the
//! client connection server.

pub mod clients;
pub mod codec;
pub mod group;

pub use clients::{ClientEvent, ClientServer};
pub use codec::{FrameCodec, FrameHeader};
pub use group::{GroupEvent, GroupTransportConfig, TcpGroupManager};
