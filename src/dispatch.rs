//! The seam between the connection driver and the rest of the bot.

use bytes::BytesMut;

/// Interface the driver uses to talk to the higher-level dispatch layer.
///
/// The driver never interprets message content: parsing and encoding are
/// delegated here so the wire format stays the collaborator's concern. All
/// methods take `&mut self` because exactly one logical task drives each
/// connection.
pub trait Dispatch {
    /// Structured protocol message.
    type Msg;

    /// Pop one queued outbound message, or `None` when nothing is pending.
    fn take_outbound(&mut self) -> Option<Self::Msg>;

    /// Deliver one parsed inbound message for higher-level dispatch.
    fn feed_inbound(&mut self, msg: Self::Msg);

    /// Parse one wire line (terminator already stripped). Returning `None`
    /// drops the line; an unparseable line is not fatal.
    fn parse_line(&mut self, line: &[u8]) -> Option<Self::Msg>;

    /// Append the wire encoding of `msg`, terminator included, to `dst`.
    fn encode(&mut self, msg: &Self::Msg, dst: &mut BytesMut);

    /// Clear session state (nick registration, channel membership) ahead of
    /// a reconnect that should not preserve context.
    fn reset_session(&mut self);

    /// Whether the bot as a whole is shutting down. Checked once per pump
    /// tick; suppresses the prompt-reply flush and reconnect log noise.
    fn is_shutting_down(&self) -> bool;

    /// Called exactly once when the connection reaches `Closed` and the
    /// driver unregisters itself.
    fn connection_closed(&mut self) {}
}
