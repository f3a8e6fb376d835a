//! The integrated protocol: msgpack frames straight over a transport
//! stream, with migration-aware inbound staging.
//!
//! A reader thread owns the stream's read half and the incremental
//! decoder. What it does with a decoded message depends on the
//! migration state: the first message of a fresh channel goes straight
//! up to the app, everything after that is buffered until the final
//! owner is known, then buffered and live messages flow to that owner
//! in arrival order.

use crate::config::ConnectRetryConfig;
use crate::connection::{ConnId, MigrationState};
use crate::error::{MigrationError, ProtocolError};
use crate::msg::codec::{encode, MsgDecoder};
use crate::msg::Msg;
use crate::protocol::{ConnectedFn, MsgSink, Protocol, ProtocolRole};
use crate::transport::{AcceptFn, Listener, StreamPair, StreamRx, StreamTx, Transport};
use crate::utils::uri::Uri;
use crate::utils::CancelToken;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

const READ_TICK: Duration = Duration::from_millis(100);

pub(crate) struct ProtoShared {
    conn_id: ConnId,
    migration: AtomicU8,
    staged: Mutex<VecDeque<Msg>>,
    sink: Mutex<Option<MsgSink>>,
    stream_tx: Mutex<Option<Box<dyn StreamTx>>>,
    closed: AtomicBool,
    closed_notified: AtomicBool,
}

impl ProtoShared {
    fn new(conn_id: ConnId) -> Arc<Self> {
        Arc::new(Self {
            conn_id,
            migration: AtomicU8::new(MigrationState::Init as u8),
            staged: Mutex::new(VecDeque::new()),
            sink: Mutex::new(None),
            stream_tx: Mutex::new(None),
            closed: AtomicBool::new(false),
            closed_notified: AtomicBool::new(false),
        })
    }

    fn migration_state(&self) -> MigrationState {
        MigrationState::from_u8(self.migration.load(Ordering::Acquire))
    }

    fn current_sink(&self) -> Option<MsgSink> {
        self.sink.lock().clone()
    }

    /// Reader-thread entry for each decoded message.
    fn on_inbound(&self, msg: Msg) {
        let sink = self.current_sink();
        let mut staged = self.staged.lock();
        match self.migration_state() {
            MigrationState::Init => {
                // First message of the channel: it decides where this
                // connection will live, so the app gets it directly.
                self.migration
                    .store(MigrationState::FirstMsgSeen as u8, Ordering::Release);
                drop(staged);
                match sink {
                    Some(sink) => sink.deliver_first(self.conn_id, msg),
                    None => warn!(
                        "[Protocol] inbound on sink-less connection {}, dropped",
                        self.conn_id.simple()
                    ),
                }
            }
            MigrationState::FirstMsgSeen => {
                // Migration in flight: hold everything until `clean`.
                staged.push_back(msg);
            }
            MigrationState::Done => {
                staged.push_back(msg);
                drop(staged);
                if let Some(sink) = sink {
                    sink.wakeup(self.conn_id);
                }
            }
        }
    }

    fn notify_closed_once(&self) {
        if self
            .closed_notified
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if let Some(sink) = self.current_sink() {
            sink.notify_closed(self.conn_id);
        }
    }
}

fn spawn_reader(shared: Arc<ProtoShared>, mut rx: Box<dyn StreamRx>, cancel: CancelToken) {
    let name = format!("conn-reader-{}", shared.conn_id.simple());
    let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
        let mut decoder = MsgDecoder::new();
        'outer: loop {
            if cancel.is_cancelled() || shared.closed.load(Ordering::Acquire) {
                break;
            }
            match rx.recv(READ_TICK) {
                Ok(Some(chunk)) => {
                    decoder.feed(&chunk);
                    loop {
                        match decoder.next() {
                            Ok(Some(msg)) => shared.on_inbound(msg),
                            Ok(None) => break,
                            Err(e) => {
                                warn!(
                                    "[Protocol] decode failed on {}: {e}",
                                    shared.conn_id.simple()
                                );
                                break 'outer;
                            }
                        }
                    }
                }
                Ok(None) => break,
                Err(ref e)
                    if e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    debug!(
                        "[Protocol] transport error on {}: {e}",
                        shared.conn_id.simple()
                    );
                    break;
                }
            }
        }
        shared.notify_closed_once();
    });
    if spawned.is_err() {
        warn!("[Protocol] failed to spawn reader thread {name}");
    }
}

/// Protocol implementation carrying the runtime's own framing over any
/// byte transport.
pub struct IntegratedProtocol {
    shared: Arc<ProtoShared>,
    role: ProtocolRole,
    cancel: CancelToken,
}

impl IntegratedProtocol {
    /// Wrap an established stream (typically an accepted one). The
    /// reader starts immediately; `sink` must already be in place.
    pub fn attach_stream(
        role: ProtocolRole,
        pair: StreamPair,
        sink: MsgSink,
        parent_cancel: &CancelToken,
    ) -> Self {
        let shared = ProtoShared::new(Uuid::new_v4());
        *shared.sink.lock() = Some(sink);
        *shared.stream_tx.lock() = Some(pair.tx);
        let cancel = parent_cancel.new_child();
        spawn_reader(shared.clone(), pair.rx, cancel.clone());
        Self {
            shared,
            role,
            cancel,
        }
    }

    /// A protocol with no stream yet; `connect_to` will dial out.
    pub fn connecting(role: ProtocolRole, sink: MsgSink, parent_cancel: &CancelToken) -> Self {
        let shared = ProtoShared::new(Uuid::new_v4());
        *shared.sink.lock() = Some(sink);
        Self {
            cancel: parent_cancel.new_child(),
            shared,
            role,
        }
    }

    pub(crate) fn shared(&self) -> Arc<ProtoShared> {
        self.shared.clone()
    }

    pub(crate) fn install_stream(shared: &Arc<ProtoShared>, pair: StreamPair, cancel: CancelToken) {
        *shared.stream_tx.lock() = Some(pair.tx);
        spawn_reader(shared.clone(), pair.rx, cancel);
    }
}

impl Protocol for IntegratedProtocol {
    fn role(&self) -> ProtocolRole {
        self.role
    }

    fn conn_id(&self) -> ConnId {
        self.shared.conn_id
    }

    fn send_msg(&mut self, msg: &Msg) -> Result<(), ProtocolError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(ProtocolError::Closed);
        }
        let frame = encode(msg)?;
        let mut guard = self.shared.stream_tx.lock();
        match guard.as_mut() {
            Some(tx) => tx.send(frame).map_err(ProtocolError::Transport),
            None => Err(ProtocolError::Closed),
        }
    }

    fn drain_inbound(&mut self) -> Vec<Msg> {
        let mut staged = self.shared.staged.lock();
        staged.drain(..).collect()
    }

    fn migration_state(&self) -> MigrationState {
        self.shared.migration_state()
    }

    fn advance_migration(&mut self, to: MigrationState) -> Result<(), MigrationError> {
        let next = self.shared.migration_state().transition(to)?;
        self.shared.migration.store(next as u8, Ordering::Release);
        Ok(())
    }

    fn migrate(&mut self, sink: MsgSink) {
        *self.shared.sink.lock() = Some(sink);
    }

    fn clean(&mut self) -> Result<(), MigrationError> {
        self.advance_migration(MigrationState::Done)?;
        let pending = !self.shared.staged.lock().is_empty();
        if pending {
            if let Some(sink) = self.shared.current_sink() {
                sink.wakeup(self.shared.conn_id);
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        if self
            .shared
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.cancel.cancel();
        let stream = self.shared.stream_tx.lock().take();
        match stream {
            Some(mut tx) => {
                // The reader observes the shutdown as EOF and confirms
                // through the sink.
                tx.close();
            }
            None => {
                // No stream to tear down; this covers dials still in
                // flight, whose late-installed reader exits on the
                // closed flag without notifying again.
                self.shared.notify_closed_once();
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    fn listen(
        &mut self,
        transport: &dyn Transport,
        uri: &Uri,
        on_accept: AcceptFn,
    ) -> Result<Box<dyn Listener>, ProtocolError> {
        if self.role != ProtocolRole::Listen {
            return Err(ProtocolError::NotSupported("listen"));
        }
        transport.listen(uri, on_accept).map_err(ProtocolError::from)
    }

    fn connect_to(
        &mut self,
        transport: Arc<dyn Transport>,
        uri: &Uri,
        retry: &ConnectRetryConfig,
        cancel: &CancelToken,
        on_connected: ConnectedFn,
    ) -> Result<(), ProtocolError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(ProtocolError::Closed);
        }
        crate::protocol::retry::spawn_connect(
            transport,
            uri.clone(),
            retry.clone(),
            cancel.new_child(),
            self.shared.clone(),
            self.cancel.clone(),
            on_connected,
        );
        Ok(())
    }
}
