//! In-process transport.
//!
//! Streams are crossbeam channel pairs; listeners are entries in a
//! shared hub keyed by URI authority. Lets several apps talk inside
//! one binary, which is how the scenario tests run whole graphs
//! without sockets.

use crate::error::{RecvError, SendError};
use crate::io::base::{BaseRx, BaseTx};
use crate::io::mpmc::{MpmcChannel, MpmcReceiver, MpmcSender};
use crate::transport::{AcceptFn, Listener, StreamPair, StreamRx, StreamTx, Transport};
use crate::utils::uri::Uri;
use crate::utils::CancelToken;
use ahash::AHashMap;
use bytes::Bytes;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::time::Duration;

const STREAM_DEPTH: usize = 1024;

/// Registry of in-process listeners. One hub per test/registry; apps
/// sharing a hub can reach each other.
#[derive(Default)]
pub struct MemoryHub {
    listeners: Mutex<AHashMap<String, AcceptFn>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
}

impl MemoryTransport {
    pub fn new(hub: Arc<MemoryHub>) -> Self {
        Self { hub }
    }
}

struct MemListener {
    hub: Arc<MemoryHub>,
    key: Option<String>,
}

impl Listener for MemListener {
    fn close(&mut self) {
        if let Some(key) = self.key.take() {
            self.hub.listeners.lock().remove(&key);
        }
    }
}

impl Drop for MemListener {
    fn drop(&mut self) {
        self.close();
    }
}

struct MemStreamTx {
    tx: Option<MpmcSender<Bytes>>,
    cancel: CancelToken,
}

impl StreamTx for MemStreamTx {
    fn send(&mut self, frame: Bytes) -> io::Result<()> {
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stream closed"))?;
        tx.send(frame, &self.cancel, Some(Duration::from_secs(5)))
            .map_err(|e: SendError<Bytes>| {
                io::Error::new(io::ErrorKind::BrokenPipe, e.reason.to_string())
            })
    }

    fn close(&mut self) {
        // Dropping the sender disconnects the peer's rx, which it
        // observes as EOF.
        self.tx = None;
    }
}

struct MemStreamRx {
    rx: MpmcReceiver<Bytes>,
    cancel: CancelToken,
}

impl StreamRx for MemStreamRx {
    fn recv(&mut self, timeout: Duration) -> io::Result<Option<Bytes>> {
        match self.rx.recv(&self.cancel, Some(timeout)) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvError::Timeout) => Err(io::Error::new(io::ErrorKind::TimedOut, "recv timeout")),
            Err(RecvError::Disconnected) => Ok(None),
            Err(RecvError::Cancelled) => Ok(None),
            Err(other) => Err(io::Error::new(io::ErrorKind::Other, other.to_string())),
        }
    }
}

fn stream_duplex(peer_a: &str, peer_b: &str) -> (StreamPair, StreamPair) {
    let (a_tx, b_rx) = MpmcChannel::bounded::<Bytes>(STREAM_DEPTH);
    let (b_tx, a_rx) = MpmcChannel::bounded::<Bytes>(STREAM_DEPTH);
    let cancel = CancelToken::new_root();

    let a = StreamPair {
        tx: Box::new(MemStreamTx {
            tx: Some(a_tx),
            cancel: cancel.clone(),
        }),
        rx: Box::new(MemStreamRx {
            rx: a_rx,
            cancel: cancel.clone(),
        }),
        peer: peer_b.to_string(),
    };
    let b = StreamPair {
        tx: Box::new(MemStreamTx {
            tx: Some(b_tx),
            cancel: cancel.clone(),
        }),
        rx: Box::new(MemStreamRx {
            rx: b_rx,
            cancel,
        }),
        peer: peer_a.to_string(),
    };
    (a, b)
}

impl Transport for MemoryTransport {
    fn scheme(&self) -> &'static str {
        "mem"
    }

    fn listen(&self, uri: &Uri, on_accept: AcceptFn) -> io::Result<Box<dyn Listener>> {
        let key = uri.authority();
        let mut listeners = self.hub.listeners.lock();
        if listeners.contains_key(&key) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("'{key}' already has a listener"),
            ));
        }
        listeners.insert(key.clone(), on_accept);
        Ok(Box::new(MemListener {
            hub: self.hub.clone(),
            key: Some(key),
        }))
    }

    fn connect(&self, uri: &Uri) -> io::Result<StreamPair> {
        let key = uri.authority();
        let mut listeners = self.hub.listeners.lock();
        let on_accept = listeners.get_mut(&key).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("no listener at '{key}'"),
            )
        })?;

        let (client, server) = stream_duplex("client", &key);
        on_accept(server);
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel as cbchan;

    #[test]
    fn connect_reaches_listener() {
        let hub = MemoryHub::new();
        let transport = MemoryTransport::new(hub.clone());
        let uri = Uri::parse("mem://alpha:1/").unwrap();

        let (accepted_tx, accepted_rx) = cbchan::unbounded::<StreamPair>();
        let _listener = transport
            .listen(
                &uri,
                Box::new(move |pair| {
                    let _ = accepted_tx.send(pair);
                }),
            )
            .unwrap();

        let mut client = transport.connect(&uri).unwrap();
        let mut server = accepted_rx
            .recv_timeout(Duration::from_secs(1))
            .expect("accept");

        client.tx.send(Bytes::from_static(b"ping")).unwrap();
        let got = server.rx.recv(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(&got[..], b"ping");

        server.tx.send(Bytes::from_static(b"pong")).unwrap();
        let got = client.rx.recv(Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(&got[..], b"pong");
    }

    #[test]
    fn close_is_seen_as_eof() {
        let hub = MemoryHub::new();
        let transport = MemoryTransport::new(hub.clone());
        let uri = Uri::parse("mem://beta:1/").unwrap();

        let (accepted_tx, accepted_rx) = cbchan::unbounded::<StreamPair>();
        let _listener = transport
            .listen(
                &uri,
                Box::new(move |pair| {
                    let _ = accepted_tx.send(pair);
                }),
            )
            .unwrap();

        let mut client = transport.connect(&uri).unwrap();
        let mut server = accepted_rx
            .recv_timeout(Duration::from_secs(1))
            .expect("accept");

        client.tx.close();
        assert!(server.rx.recv(Duration::from_secs(1)).unwrap().is_none());
    }

    #[test]
    fn connect_without_listener_is_refused() {
        let hub = MemoryHub::new();
        let transport = MemoryTransport::new(hub);
        let uri = Uri::parse("mem://ghost:1/").unwrap();
        match transport.connect(&uri) {
            Err(err) => assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused),
            Ok(_) => panic!("connect should be refused"),
        }
    }

    #[test]
    fn listener_close_frees_the_address() {
        let hub = MemoryHub::new();
        let transport = MemoryTransport::new(hub);
        let uri = Uri::parse("mem://gamma:1/").unwrap();

        let mut listener = transport.listen(&uri, Box::new(|_| {})).unwrap();
        listener.close();
        assert!(transport.listen(&uri, Box::new(|_| {})).is_ok());
    }
}
