//! Client handshake and reconnect

pub mod manager;
pub mod messages;
pub mod sequence;

pub use manager::{
    ChannelManager, HandshakeContext, HandshakeSink, ReconnectTimer, ServerClientHandshakeManager,
    TimerCallback, TokioReconnectTimer,
};
pub use messages::{ClientHandshake, ClientMessage, HandshakeAck};
pub use sequence::SequenceValidator;
