pub mod memory;
pub mod tcp;

use crate::utils::uri::Uri;
use bytes::Bytes;
use std::io;
use std::time::Duration;

/// Write half of a byte stream. Frames are already laid out by the
/// codec; the transport only moves bytes.
pub trait StreamTx: Send {
    fn send(&mut self, frame: Bytes) -> io::Result<()>;
    fn close(&mut self);
}

/// Read half of a byte stream, consumed by a dedicated reader thread.
pub trait StreamRx: Send {
    /// Blocking receive with timeout. `Ok(None)` means EOF. A timeout
    /// surfaces as `ErrorKind::TimedOut`/`WouldBlock`, which callers
    /// treat as "check cancellation and retry".
    fn recv(&mut self, timeout: Duration) -> io::Result<Option<Bytes>>;
}

/// One established byte channel.
pub struct StreamPair {
    pub tx: Box<dyn StreamTx>,
    pub rx: Box<dyn StreamRx>,
    /// Transport-level peer description, for logs only.
    pub peer: String,
}

/// Handle to a listening endpoint. Dropping or closing it stops
/// accepting; established streams are unaffected.
pub trait Listener: Send {
    fn close(&mut self);
}

pub type AcceptFn = Box<dyn FnMut(StreamPair) + Send>;

/// Byte-transport collaborator: everything the runtime needs from the
/// outside world is accept/connect/send/close on framed byte streams.
pub trait Transport: Send + Sync {
    fn scheme(&self) -> &'static str;

    fn listen(&self, uri: &Uri, on_accept: AcceptFn) -> io::Result<Box<dyn Listener>>;

    fn connect(&self, uri: &Uri) -> io::Result<StreamPair>;
}
