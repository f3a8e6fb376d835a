//! TCP transport on std::net.
//!
//! The accept loop runs on its own thread with a non-blocking
//! listener; each stream is a cloned `TcpStream` pair, with read
//! timeouts set per call so reader threads stay cancellable.

use crate::transport::{AcceptFn, Listener, StreamPair, StreamRx, StreamTx, Transport};
use crate::utils::uri::Uri;
use bytes::{Bytes, BytesMut};
use std::io;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const READ_CHUNK: usize = 64 * 1024;
const ACCEPT_POLL: Duration = Duration::from_millis(50);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

struct TcpListenerHandle {
    closed: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
}

impl Listener for TcpListenerHandle {
    fn close(&mut self) {
        self.closed.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for TcpListenerHandle {
    fn drop(&mut self) {
        self.close();
    }
}

struct TcpStreamTx {
    stream: TcpStream,
}

impl StreamTx for TcpStreamTx {
    fn send(&mut self, frame: Bytes) -> io::Result<()> {
        self.stream.write_all(&frame)
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

struct TcpStreamRx {
    stream: TcpStream,
    buf: Box<[u8]>,
}

impl StreamRx for TcpStreamRx {
    fn recv(&mut self, timeout: Duration) -> io::Result<Option<Bytes>> {
        self.stream.set_read_timeout(Some(timeout))?;
        match self.stream.read(&mut self.buf) {
            Ok(0) => Ok(None),
            Ok(n) => Ok(Some(BytesMut::from(&self.buf[..n]).freeze())),
            Err(e) => Err(e),
        }
    }
}

fn pair_from(stream: TcpStream) -> io::Result<StreamPair> {
    stream.set_nodelay(true)?;
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let tx_stream = stream.try_clone()?;
    Ok(StreamPair {
        tx: Box::new(TcpStreamTx { stream: tx_stream }),
        rx: Box::new(TcpStreamRx {
            stream,
            buf: vec![0u8; READ_CHUNK].into_boxed_slice(),
        }),
        peer,
    })
}

fn resolve(uri: &Uri) -> io::Result<SocketAddr> {
    uri.authority()
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("cannot resolve '{}'", uri.authority()),
            )
        })
}

impl Transport for TcpTransport {
    fn scheme(&self) -> &'static str {
        "msgpack"
    }

    fn listen(&self, uri: &Uri, mut on_accept: AcceptFn) -> io::Result<Box<dyn Listener>> {
        let listener = TcpListener::bind(resolve(uri)?)?;
        listener.set_nonblocking(true)?;

        let closed = Arc::new(AtomicBool::new(false));
        let closed_for_thread = closed.clone();
        let authority = uri.authority();

        let join = thread::Builder::new()
            .name(format!("tcp-accept-{authority}"))
            .spawn(move || loop {
                if closed_for_thread.load(Ordering::Acquire) {
                    break;
                }
                match listener.accept() {
                    Ok((stream, _addr)) => {
                        if stream.set_nonblocking(false).is_err() {
                            continue;
                        }
                        match pair_from(stream) {
                            Ok(pair) => on_accept(pair),
                            Err(e) => {
                                tracing::warn!("[TcpTransport] bad accepted stream: {e}");
                            }
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                        thread::sleep(ACCEPT_POLL);
                    }
                    Err(e) => {
                        tracing::error!("[TcpTransport] accept failed on {authority}: {e}");
                        break;
                    }
                }
            })?;

        Ok(Box::new(TcpListenerHandle {
            closed,
            join: Some(join),
        }))
    }

    fn connect(&self, uri: &Uri) -> io::Result<StreamPair> {
        let addr = resolve(uri)?;
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        pair_from(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel as cbchan;

    #[test]
    fn loopback_round_trip() {
        let transport = TcpTransport::new();
        // Port 0 lets the OS pick; rebuild the URI from the bound addr.
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        let uri = Uri::parse(&format!("msgpack://127.0.0.1:{port}/")).unwrap();

        let (accepted_tx, accepted_rx) = cbchan::unbounded::<StreamPair>();
        let mut listener = transport
            .listen(
                &uri,
                Box::new(move |pair| {
                    let _ = accepted_tx.send(pair);
                }),
            )
            .unwrap();

        let mut client = transport.connect(&uri).unwrap();
        let mut server = accepted_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("accept");

        client.tx.send(Bytes::from_static(b"hello")).unwrap();
        let mut got = Vec::new();
        while got.len() < 5 {
            match server.rx.recv(Duration::from_secs(1)) {
                Ok(Some(chunk)) => got.extend_from_slice(&chunk),
                Ok(None) => panic!("unexpected eof"),
                Err(ref e)
                    if e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::WouldBlock =>
                {
                    continue
                }
                Err(e) => panic!("recv failed: {e}"),
            }
        }
        assert_eq!(&got[..], b"hello");

        client.tx.close();
        listener.close();
    }

    #[test]
    fn connect_refused_without_listener() {
        let transport = TcpTransport::new();
        let probe = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);
        let uri = Uri::parse(&format!("msgpack://127.0.0.1:{port}/")).unwrap();
        assert!(transport.connect(&uri).is_err());
    }
}
