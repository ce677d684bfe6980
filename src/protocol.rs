use std::any::Any;

use crate::connection::Connection;
use crate::ring_buffer::RingBuffer;

/// Per-message context produced by `unpack` and handed to `on_message`,
/// e.g. a frame header. Opaque to the core.
pub type MessageCtx = Box<dyn Any + Send>;

/// A framing strategy: turns the inbound byte stream into messages and
/// outbound values into bytes.
///
/// `unpack` consumes zero or more bytes from `buffer` and yields at most
/// one decoded message; return `None` when no complete message is buffered
/// yet. The event loop calls it in a loop until it yields `None`. Payloads
/// are owned: an implementation must copy out of `buffer` rather than
/// retain references into it, typically by speculating with the buffer's
/// virtual cursor and reverting when the frame is still incomplete.
///
/// Both methods run on the connection's owning loop thread.
pub trait Protocol: Send + Sync {
    fn unpack(
        &self,
        conn: &Connection,
        buffer: &mut RingBuffer,
    ) -> Option<(Option<MessageCtx>, Vec<u8>)>;

    fn pack(&self, conn: &Connection, data: &[u8]) -> Vec<u8>;
}

/// Pass-through framing: every read batch is one message, writes go out
/// verbatim.
#[derive(Default)]
pub struct DefaultProtocol;

impl Protocol for DefaultProtocol {
    fn unpack(
        &self,
        _conn: &Connection,
        buffer: &mut RingBuffer,
    ) -> Option<(Option<MessageCtx>, Vec<u8>)> {
        if buffer.is_empty() {
            return None;
        }

        let mut data = vec![0u8; buffer.len()];
        buffer.read(&mut data);
        Some((None, data))
    }

    fn pack(&self, _conn: &Connection, data: &[u8]) -> Vec<u8> {
        data.to_vec()
    }
}
