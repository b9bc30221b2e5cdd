/// Connection lifecycle of the transport channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events the transport channel queues toward the sync engine.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// Raw text frame as received from the socket.
    InboundFrame(String),
    Connected,
    Disconnected,
}
