pub mod integrated;
pub mod retry;

use crate::app::App;
use crate::config::ConnectRetryConfig;
use crate::connection::{ConnId, MigrationState};
use crate::engine::EngineHandle;
use crate::error::{MigrationError, ProtocolError};
use crate::msg::Msg;
use crate::runloop::LoopHandle;
use crate::transport::{AcceptFn, Listener, Transport};
use crate::utils::uri::Uri;
use crate::utils::CancelToken;
use std::sync::Arc;

/// Role of a protocol instance relative to this app. `In*` roles were
/// accepted by our endpoint, `Out*` roles were initiated by us;
/// External means the peer is outside the runtime (a client).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProtocolRole {
    Invalid,
    Listen,
    InInternal,
    InExternal,
    OutInternal,
    OutExternal,
}

/// Where inbound messages and transport-closed notifications go. Swapped
/// during migration from the app loop to the owning engine's loop.
#[derive(Clone)]
pub enum MsgSink {
    App(LoopHandle<App>),
    Engine(EngineHandle),
}

impl MsgSink {
    /// Nudge the owner: there is buffered inbound to drain.
    pub fn wakeup(&self, conn: ConnId) {
        match self {
            MsgSink::App(h) => {
                h.post(move |app| app.on_conn_inbound(conn));
            }
            MsgSink::Engine(h) => {
                h.post(move |engine| engine.on_conn_inbound(conn));
            }
        }
    }

    /// Hand the very first message of a fresh connection up, bypassing
    /// the buffer. Only the app ever receives this.
    pub fn deliver_first(&self, conn: ConnId, msg: Msg) {
        match self {
            MsgSink::App(h) => {
                h.post(move |app| app.on_first_conn_msg(conn, msg));
            }
            MsgSink::Engine(h) => {
                // A first message cannot appear after migration, but
                // route it anyway rather than drop it.
                h.post(move |engine| {
                    engine.on_conn_inbound_push(conn, msg);
                });
            }
        }
    }

    pub fn notify_closed(&self, conn: ConnId) {
        match self {
            MsgSink::App(h) => {
                h.post(move |app| app.on_conn_transport_closed(conn));
            }
            MsgSink::Engine(h) => {
                h.post(move |engine| engine.on_conn_transport_closed(conn));
            }
        }
    }
}

pub type ConnectedFn = Box<dyn FnOnce(bool) + Send>;

/// Wire adapter owned by a connection (or, for `Listen`, by the app's
/// endpoint). Capability methods have failing defaults; a protocol
/// implements what its transport can do.
pub trait Protocol: Send {
    fn role(&self) -> ProtocolRole;

    fn conn_id(&self) -> ConnId;

    fn send_msg(&mut self, msg: &Msg) -> Result<(), ProtocolError>;

    /// Take every buffered inbound message, oldest first.
    fn drain_inbound(&mut self) -> Vec<Msg>;

    fn migration_state(&self) -> MigrationState;

    fn advance_migration(&mut self, to: MigrationState) -> Result<(), MigrationError>;

    /// Point inbound delivery at the engine that now owns the
    /// connection. Buffered messages stay put until `clean`.
    fn migrate(&mut self, sink: MsgSink);

    /// Finish migration: state becomes `Done` and anything buffered is
    /// flushed to the new sink.
    fn clean(&mut self) -> Result<(), MigrationError>;

    /// Two-phase close, downward leg. Upward confirmation arrives as a
    /// transport-closed notification on the sink.
    fn close(&mut self);

    fn is_closed(&self) -> bool;

    fn listen(
        &mut self,
        _transport: &dyn Transport,
        _uri: &Uri,
        _on_accept: AcceptFn,
    ) -> Result<Box<dyn Listener>, ProtocolError> {
        Err(ProtocolError::NotSupported("listen"))
    }

    /// Open a channel to `uri`, retrying per config, and report the
    /// terminal outcome through `on_connected` exactly once. The
    /// default capability cannot connect at all.
    fn connect_to(
        &mut self,
        _transport: Arc<dyn Transport>,
        _uri: &Uri,
        _retry: &ConnectRetryConfig,
        _cancel: &CancelToken,
        _on_connected: ConnectedFn,
    ) -> Result<(), ProtocolError> {
        Err(ProtocolError::NotSupported("connect_to"))
    }
}
