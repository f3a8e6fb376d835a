//! Blocking client for talking to an app from outside the runtime.
//!
//! Used by tools and tests: dial the app's endpoint, push commands,
//! pull whatever comes back. No loops, no migration; just the wire
//! codec over a transport stream.

use crate::error::ProtocolError;
use crate::msg::codec::{encode, MsgDecoder};
use crate::msg::Msg;
use crate::transport::{StreamRx, StreamTx, Transport};
use crate::utils::uri::Uri;
use std::io;
use std::time::{Duration, Instant};

pub struct Client {
    tx: Box<dyn StreamTx>,
    rx: Box<dyn StreamRx>,
    decoder: MsgDecoder,
}

impl Client {
    pub fn connect(transport: &dyn Transport, uri: &Uri) -> io::Result<Self> {
        let pair = transport.connect(uri)?;
        Ok(Self {
            tx: pair.tx,
            rx: pair.rx,
            decoder: MsgDecoder::new(),
        })
    }

    pub fn send_msg(&mut self, msg: &Msg) -> Result<(), ProtocolError> {
        let frame = encode(msg)?;
        self.tx.send(frame).map_err(ProtocolError::Transport)
    }

    /// Next message within `timeout`. `Ok(None)` means the peer closed.
    pub fn recv_msg(&mut self, timeout: Duration) -> Result<Option<Msg>, ProtocolError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(msg) = self.decoder.next()? {
                return Ok(Some(msg));
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(ProtocolError::Transport(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "no message within timeout",
                )));
            }
            match self.rx.recv(left) {
                Ok(Some(chunk)) => self.decoder.feed(&chunk),
                Ok(None) => return Ok(None),
                Err(ref e)
                    if e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(ProtocolError::Transport(e)),
            }
        }
    }

    pub fn close(&mut self) {
        self.tx.close();
    }
}
