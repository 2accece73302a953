//! Transport abstraction: where session messages are written.

use crate::error::{RelayError, Result};
use crate::types::StreamMessage;
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::io::Write;

/// Append-only, ordered destination for one client's messages.
///
/// Writes run on the session's worker thread, and `SessionManager::close`
/// and `shutdown` wait for an in-flight write to return.
pub trait MessageSink: Send {
    /// Write one message. Any error is treated as the client being gone.
    ///
    /// Must not block indefinitely. A transport that can stall (a half-open
    /// socket) has to bound its writes, e.g. with a socket write timeout,
    /// and return an error when the bound is hit.
    fn write_message(&mut self, message: &StreamMessage) -> Result<()>;

    /// Release the underlying transport. Called once, during teardown.
    fn close(&mut self) {}
}

/// Writes server-sent-events frames (`data: <json>\n\n`) to any writer.
///
/// For a `TcpStream`, set `set_write_timeout` before handing it over so a
/// stalled client surfaces as a write error.
pub struct SseSink<W: Write + Send> {
    writer: Option<W>,
}

impl<W: Write + Send> SseSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Some(writer),
        }
    }

    /// Recover the writer, unless the sink was already closed.
    pub fn into_inner(self) -> Option<W> {
        self.writer
    }
}

impl<W: Write + Send> MessageSink for SseSink<W> {
    fn write_message(&mut self, message: &StreamMessage) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| RelayError::TransportWrite("sink closed".into()))?;

        let frame = message.to_sse_frame()?;
        writer
            .write_all(frame.as_bytes())
            .map_err(|e| RelayError::TransportWrite(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| RelayError::TransportWrite(e.to_string()))
    }

    fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.flush();
        }
    }
}

/// Forwards messages into a channel, for in-process transports.
///
/// Writes fail once the receiving side is dropped. Closing the sink drops
/// the sender, so the receiver sees disconnection after the last message.
pub struct ChannelSink {
    sender: Option<Sender<StreamMessage>>,
}

impl ChannelSink {
    pub fn new(sender: Sender<StreamMessage>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    /// Unbounded channel sink plus its receiving end.
    pub fn unbounded() -> (Self, Receiver<StreamMessage>) {
        let (sender, receiver) = unbounded();
        (Self::new(sender), receiver)
    }
}

impl MessageSink for ChannelSink {
    fn write_message(&mut self, message: &StreamMessage) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| RelayError::TransportWrite("sink closed".into()))?;

        sender
            .send(message.clone())
            .map_err(|_| RelayError::TransportWrite("receiver dropped".into()))
    }

    fn close(&mut self) {
        self.sender = None;
    }
}
