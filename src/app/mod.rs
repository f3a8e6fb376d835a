//! The app: process-level container and front door.
//!
//! An app owns its listening endpoint, the engines running graphs, and
//! every connection that has not (yet) been claimed by an engine. Like
//! the engine, all of its state lives on one loop thread and is reached
//! through posted tasks.

mod registry;

pub use registry::AppRegistry;

use crate::config::AppConfig;
use crate::connection::{AttachTo, ConnId, Connection, MigrationState};
use crate::engine::{closing_allows, Engine, EngineHandle};
use crate::error::GraphError;
use crate::extension::ExtensionRegistry;
use crate::io::swap::SwapQueue;
use crate::msg::{Msg, MsgType, Payload, StatusCode};
use crate::protocol::integrated::IntegratedProtocol;
use crate::protocol::{MsgSink, Protocol, ProtocolRole};
use crate::runloop::{LoopHandle, RunLoop};
use crate::transport::{AcceptFn, Listener, StreamPair, Transport};
use crate::utils::uri::{AdvertisedHost, ConfiguredHost, Uri};
use ahash::AHashMap;
use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub(crate) struct EngineRecord {
    graph_id: String,
    handle: EngineHandle,
    runloop: Option<RunLoop<Engine>>,
    shared: Option<Box<Engine>>,
}

pub struct App {
    uri: String,
    cfg: AppConfig,
    handle: LoopHandle<App>,
    transport: Arc<dyn Transport>,
    registry: Arc<ExtensionRegistry>,
    listener: Option<Box<dyn Listener>>,
    endpoint: Option<Box<dyn Protocol>>,
    engines: Vec<EngineRecord>,
    /// Accepted connections no engine has claimed. They never hold the
    /// app open and never close it.
    orphan_conns: AHashMap<ConnId, Connection>,
    /// External command id to the connection its answer goes out on.
    client_routes: AHashMap<String, ConnId>,
    in_msgs: SwapQueue<Msg>,
    is_closing: bool,
    /// Keeps the non-blocking log writer alive for the app's lifetime.
    _log_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

impl App {
    /// Start the app on its own loop thread: endpoint listening,
    /// auto-start graphs queued.
    pub fn spawn(
        cfg: AppConfig,
        transport: Arc<dyn Transport>,
        registry: Arc<ExtensionRegistry>,
    ) -> Result<RunLoop<App>> {
        Self::spawn_with_host(cfg, transport, registry, Arc::new(ConfiguredHost))
    }

    /// Like `spawn`, with a resolver for the URI peers should dial.
    /// Deployments behind NAT advertise a different address than the
    /// one they bind.
    pub fn spawn_with_host(
        cfg: AppConfig,
        transport: Arc<dyn Transport>,
        registry: Arc<ExtensionRegistry>,
        host: Arc<dyn AdvertisedHost>,
    ) -> Result<RunLoop<App>> {
        let name = format!("app-{}", cfg.uri);
        let timeout = cfg.handshake_timeout();
        RunLoop::spawn_with_timeout(&name, None, timeout, move |handle| {
            App::init(cfg, transport, registry, host, handle)
        })
    }

    fn init(
        cfg: AppConfig,
        transport: Arc<dyn Transport>,
        registry: Arc<ExtensionRegistry>,
        host: Arc<dyn AdvertisedHost>,
        handle: LoopHandle<App>,
    ) -> Result<App> {
        let uri = Uri::parse(&cfg.uri)?;
        let advertised = host.advertised_uri(&cfg.uri);
        let log_guard = match &cfg.logger {
            Some(logger) => logger.init()?,
            None => None,
        };

        let sink = MsgSink::App(handle.clone());
        let mut endpoint: Box<dyn Protocol> = Box::new(IntegratedProtocol::connecting(
            ProtocolRole::Listen,
            sink,
            handle.cancel_token(),
        ));

        let accept_handle = handle.clone();
        let accept_cancel = handle.cancel_token().clone();
        let on_accept: AcceptFn = Box::new(move |pair: StreamPair| {
            debug!("[App] accepted connection from {}", pair.peer);
            let sink = MsgSink::App(accept_handle.clone());
            let protocol =
                IntegratedProtocol::attach_stream(ProtocolRole::InExternal, pair, sink, &accept_cancel);
            let conn = Connection::new(Box::new(protocol));
            conn.set_attach(AttachTo::App);
            accept_handle.post(move |app| app.register_orphan(conn));
        });
        let listener = endpoint.listen(transport.as_ref(), &uri, on_accept)?;

        info!("[App {}] listening", cfg.uri);

        handle.post(|app| app.start_predefined_graphs());

        Ok(App {
            uri: advertised,
            cfg,
            handle,
            transport,
            registry,
            listener: Some(listener),
            endpoint: Some(endpoint),
            engines: Vec::new(),
            orphan_conns: AHashMap::new(),
            client_routes: AHashMap::new(),
            in_msgs: SwapQueue::new(),
            is_closing: false,
            _log_guard: log_guard,
        })
    }

    /// Bare app for unit tests that only need a live app loop.
    #[cfg(test)]
    pub(crate) fn for_tests(handle: LoopHandle<App>) -> Result<App> {
        use crate::transport::memory::{MemoryHub, MemoryTransport};
        Ok(App {
            uri: "mem://test-app:1/".into(),
            cfg: AppConfig::new("mem://test-app:1/"),
            handle,
            transport: Arc::new(MemoryTransport::new(MemoryHub::new())),
            registry: ExtensionRegistry::new(),
            listener: None,
            endpoint: None,
            engines: Vec::new(),
            orphan_conns: AHashMap::new(),
            client_routes: AHashMap::new(),
            in_msgs: SwapQueue::new(),
            is_closing: false,
            _log_guard: None,
        })
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    fn start_predefined_graphs(&mut self) {
        let defs = match &self.cfg.predefined_graphs {
            Some(defs) => defs.clone(),
            None => return,
        };
        for def in defs.iter().filter(|d| d.auto_start) {
            info!("[App {}] auto-starting graph '{}'", self.uri, def.name);
            let mut cmd = Msg::start_graph(crate::msg::StartGraphPayload {
                predefined_graph_name: String::new(),
                long_running_mode: false,
                graph: def.graph.clone(),
            });
            cmd.cmd_id = Uuid::new_v4().simple().to_string();
            cmd.src = crate::msg::Loc::app(&self.uri);
            self.enqueue(cmd);
        }
    }

    pub(crate) fn register_orphan(&mut self, conn: Connection) {
        if self.is_closing {
            let mut conn = conn;
            conn.close();
            return;
        }
        self.orphan_conns.insert(conn.id(), conn);
    }

    /// Entry point for internally-generated messages.
    pub fn enqueue(&mut self, msg: Msg) {
        self.in_msgs.push(msg);
        self.process_in_msgs();
    }

    fn process_in_msgs(&mut self) {
        let batch = self.in_msgs.swap_out();
        for msg in batch {
            self.handle_in_msg(msg, None);
        }
    }

    /// The first message of a fresh connection, delivered out of band.
    /// It decides where the connection will live.
    pub(crate) fn on_first_conn_msg(&mut self, conn: ConnId, msg: Msg) {
        let msg = self.note_external(conn, msg);
        self.handle_in_msg(msg, Some(conn));

        // If the connection stayed ours, let the rest of its traffic
        // flow; the engine-not-found path resets to Init instead.
        if let Some(c) = self.orphan_conns.get_mut(&conn) {
            if c.migration_state() == MigrationState::FirstMsgSeen && !c.is_closing() {
                if let Err(e) = c.protocol_mut().clean() {
                    warn!("[App {}] failed to finish migration: {e}", self.uri);
                }
            }
        }
    }

    pub(crate) fn on_conn_inbound(&mut self, conn: ConnId) {
        let msgs = match self.orphan_conns.get_mut(&conn) {
            Some(c) => c.drain_inbound(),
            None => return,
        };
        for msg in msgs {
            let msg = self.note_external(conn, msg);
            self.handle_in_msg(msg, Some(conn));
        }
    }

    pub(crate) fn on_conn_transport_closed(&mut self, conn: ConnId) {
        if self.orphan_conns.remove(&conn).is_some() {
            self.client_routes.retain(|_, c| *c != conn);
            debug!("[App {}] connection {} closed", self.uri, conn.simple());
        }
        if self.is_closing {
            self.check_close_ready();
        }
    }

    /// Commands from outside get a fresh id, and the id doubles as the
    /// reply route back to this connection.
    fn note_external(&mut self, conn: ConnId, mut msg: Msg) -> Msg {
        if msg.kind.is_cmd_family() && msg.kind != MsgType::CmdResult {
            msg.ensure_cmd_id();
            if msg.is_external_origin() {
                self.client_routes.insert(msg.cmd_id.clone(), conn);
            }
        }
        msg
    }

    fn handle_in_msg(&mut self, msg: Msg, src_conn: Option<ConnId>) {
        if self.is_closing && !closing_allows(msg.kind) {
            debug!(
                "[App {}] dropping {:?} '{}' while closing",
                self.uri, msg.kind, msg.name
            );
            return;
        }
        match msg.kind {
            MsgType::CmdStartGraph => self.handle_start_graph(msg, src_conn),
            MsgType::CmdStopGraph => self.handle_stop_graph(msg, src_conn),
            MsgType::CmdCloseApp => {
                debug!("[App {}] close_app received", self.uri);
                self.close_app();
            }
            _ => self.route_msg(msg),
        }
    }

    fn handle_start_graph(&mut self, mut cmd: Msg, src_conn: Option<ConnId>) {
        if self.is_closing {
            // Still answered, not silently dropped, but no new engine
            // comes up under a dying app.
            let res = Msg::result_from(StatusCode::Error, &cmd).with_detail("app is closing");
            self.answer(res, src_conn);
            return;
        }
        match cmd.start_graph_payload_mut() {
            Some(payload) => {
                if !payload.predefined_graph_name.is_empty() {
                    let name = payload.predefined_graph_name.clone();
                    let found = self
                        .cfg
                        .predefined_graphs
                        .as_ref()
                        .and_then(|defs| defs.iter().find(|d| d.name == name))
                        .cloned();
                    match found {
                        Some(def) => payload.graph = def.graph,
                        None => {
                            let res = Msg::result_from(StatusCode::Error, &cmd)
                                .with_detail(&GraphError::PredefinedGraphNotFound(name).to_string());
                            self.answer(res, src_conn);
                            return;
                        }
                    }
                }
            }
            None => {
                let res = Msg::result_from(StatusCode::Error, &cmd)
                    .with_detail("start_graph without a graph payload");
                self.answer(res, src_conn);
                return;
            }
        }

        // A peer engine names the graph through its src; a fresh start
        // mints the id here.
        let graph_id = if !cmd.src.graph_id.is_empty() {
            cmd.src.graph_id.clone()
        } else {
            Uuid::new_v4().simple().to_string()
        };

        if self.engine_handle(&graph_id).is_none() {
            if let Err(e) = self.create_engine(&graph_id) {
                let res = Msg::result_from(StatusCode::Error, &cmd)
                    .with_detail(&format!("failed to start engine: {e}"));
                self.answer(res, src_conn);
                return;
            }
        }
        let engine = match self.engine_handle(&graph_id) {
            Some(h) => h,
            None => return,
        };

        if let Some(cid) = src_conn {
            self.migrate_conn_to_engine(cid, &engine);
        }
        engine.post(move |e| e.enqueue(cmd, src_conn));
    }

    /// Hand an orphan connection over to the engine that will own it.
    fn migrate_conn_to_engine(&mut self, cid: ConnId, engine: &EngineHandle) {
        let mut conn = match self.orphan_conns.remove(&cid) {
            Some(c) => c,
            None => return,
        };
        // The engine answers over the channel itself from now on.
        self.client_routes.retain(|_, c| *c != cid);

        conn.protocol_mut().migrate(MsgSink::Engine(engine.clone()));
        let result = match conn.migration_state() {
            // Nothing was ever received: the direct upgrade.
            MigrationState::Init => conn.protocol_mut().clean(),
            MigrationState::FirstMsgSeen => conn.protocol_mut().clean(),
            MigrationState::Done => Ok(()),
        };
        if let Err(e) = result {
            warn!("[App {}] migration of {} failed: {e}", self.uri, cid.simple());
        }
        conn.set_attach(AttachTo::Engine);
        engine.post(move |e| e.adopt_connection(conn));
    }

    fn handle_stop_graph(&mut self, msg: Msg, src_conn: Option<ConnId>) {
        let graph_id = match &msg.payload {
            Payload::StopGraph { graph_id } => graph_id.clone(),
            _ => String::new(),
        };
        match self.engine_handle(&graph_id) {
            Some(engine) => {
                engine.post(move |e| e.enqueue(msg, src_conn));
            }
            None => {
                // Let the next message on this channel again surface as
                // a first message.
                if let Some(cid) = src_conn {
                    if let Some(c) = self.orphan_conns.get_mut(&cid) {
                        if c.migration_state() == MigrationState::FirstMsgSeen {
                            let _ = c.protocol_mut().advance_migration(MigrationState::Init);
                        }
                    }
                }
                let res = Msg::result_from(StatusCode::Error, &msg)
                    .with_detail("Failed to find the engine to be shut down.");
                self.answer(res, src_conn);
            }
        }
    }

    /// Route a message that reached the app level: answers to external
    /// clients first, then engines by graph id.
    pub fn route_msg(&mut self, msg: Msg) {
        let dest = match msg.dests.first() {
            Some(d) => d.clone(),
            None => {
                debug!(
                    "[App {}] dropping destination-less {:?} '{}'",
                    self.uri, msg.kind, msg.name
                );
                return;
            }
        };

        if msg.kind == MsgType::CmdResult {
            if let Some(cid) = self.client_routes.get(&dest.app_uri).copied() {
                if let Some(conn) = self.orphan_conns.get_mut(&cid) {
                    if let Err(e) = conn.send_msg(&msg) {
                        warn!("[App {}] failed to answer client: {e}", self.uri);
                    }
                }
                self.client_routes.remove(&dest.app_uri);
                return;
            }
        }

        if dest.app_uri.is_empty() || dest.app_uri == self.uri {
            if !dest.graph_id.is_empty() {
                if let Some(engine) = self.engine_handle(&dest.graph_id) {
                    engine.post(move |e| e.enqueue(msg, None));
                    return;
                }
            }
            debug!(
                "[App {}] {:?} '{}' terminated at the app",
                self.uri, msg.kind, msg.name
            );
            return;
        }
        warn!("[App {}] no route to {}", self.uri, dest.app_uri);
    }

    fn answer(&mut self, res: Msg, src_conn: Option<ConnId>) {
        if let Some(cid) = src_conn {
            if let Some(conn) = self.orphan_conns.get_mut(&cid) {
                if let Err(e) = conn.send_msg(&res) {
                    warn!("[App {}] failed to answer over {}: {e}", self.uri, cid.simple());
                }
                return;
            }
        }
        self.route_msg(res);
    }

    fn engine_handle(&self, graph_id: &str) -> Option<EngineHandle> {
        self.engines
            .iter()
            .find(|r| r.graph_id == graph_id)
            .map(|r| r.handle.clone())
    }

    /// Engines sharing the app loop are looked up here by the tasks
    /// their handles post.
    pub(crate) fn shared_engine_mut(&mut self, graph_id: &str) -> Option<&mut Engine> {
        self.engines
            .iter_mut()
            .find(|r| r.graph_id == graph_id)
            .and_then(|r| r.shared.as_deref_mut())
    }

    fn create_engine(&mut self, graph_id: &str) -> Result<()> {
        let retry = self.cfg.retry();
        if self.cfg.one_loop_per_engine() {
            let app_handle = self.handle.clone();
            let app_uri = self.uri.clone();
            let gid = graph_id.to_string();
            let transport = self.transport.clone();
            let registry = self.registry.clone();
            let name = format!("engine-{graph_id}");

            let rl = RunLoop::spawn(&name, Some(self.handle.cancel_token()), move |h| {
                let cancel = h.cancel_token().clone();
                let handle = EngineHandle::Own(h);
                Ok(Engine::new(
                    &app_uri, &gid, app_handle, handle, cancel, transport, registry, retry,
                ))
            })?;
            self.engines.push(EngineRecord {
                graph_id: graph_id.to_string(),
                handle: EngineHandle::Own(rl.clone_handle()),
                runloop: Some(rl),
                shared: None,
            });
        } else {
            let handle = EngineHandle::Shared(self.handle.clone(), graph_id.to_string());
            let engine = Engine::new(
                &self.uri,
                graph_id,
                self.handle.clone(),
                handle.clone(),
                self.handle.cancel_token().new_child(),
                self.transport.clone(),
                self.registry.clone(),
                retry,
            );
            self.engines.push(EngineRecord {
                graph_id: graph_id.to_string(),
                handle,
                runloop: None,
                shared: Some(Box::new(engine)),
            });
        }
        debug!("[App {}] engine {graph_id} created", self.uri);
        Ok(())
    }

    /// Final engine-side callback of a teardown. Reclaims the loop,
    /// answers a stashed stop_graph, and decides whether the app dies
    /// with its last engine. `reply_conn` is the requester's channel
    /// when the command arrived over one the engine owned; it is handed
    /// back here because the engine's other connections are gone.
    pub(crate) fn on_engine_closed(
        &mut self,
        graph_id: String,
        stashed: Option<Msg>,
        mut reply_conn: Option<Connection>,
    ) {
        if let Some(pos) = self.engines.iter().position(|r| r.graph_id == graph_id) {
            let record = self.engines.remove(pos);
            if let Some(rl) = record.runloop {
                rl.join();
            }
        }

        if let Some(cmd) = stashed {
            if cmd.src.graph_id != graph_id {
                let res =
                    Msg::result_from(StatusCode::Ok, &cmd).with_detail("close engine done");
                match reply_conn.take() {
                    Some(mut conn) => {
                        // The channel outlived its engine; it becomes an
                        // app orphan again and carries the final result.
                        conn.protocol_mut().migrate(MsgSink::App(self.handle.clone()));
                        conn.set_attach(AttachTo::App);
                        if let Err(e) = conn.send_msg(&res) {
                            warn!("[App {}] failed to answer stop_graph: {e}", self.uri);
                        }
                        self.register_orphan(conn);
                    }
                    None => self.route_msg(res),
                }
            } else {
                // The requester died with the graph; nobody is left to
                // receive an answer.
                debug!(
                    "[App {}] stop_graph from within {} goes unanswered",
                    self.uri, graph_id
                );
            }
        }
        if let Some(mut conn) = reply_conn {
            conn.close();
        }

        if self.engines.is_empty() {
            if self.is_closing {
                self.check_close_ready();
            } else if !self.cfg.long_running() {
                self.close_app();
            }
        }
    }

    pub fn close_app(&mut self) {
        if self.is_closing {
            return;
        }
        self.is_closing = true;
        info!("[App {}] closing", self.uri);

        if let Some(mut listener) = self.listener.take() {
            listener.close();
        }
        if let Some(mut endpoint) = self.endpoint.take() {
            endpoint.close();
        }
        for record in &self.engines {
            let h = record.handle.clone();
            h.post(|engine| engine.close("app closing"));
        }
        for conn in self.orphan_conns.values_mut() {
            conn.close();
        }
        self.check_close_ready();
    }

    fn check_close_ready(&mut self) {
        if !self.is_closing || !self.engines.is_empty() {
            return;
        }
        // Orphan connections do not hold the app open; their readers
        // die with the loop's cancel token.
        info!("[App {}] closed", self.uri);
        self.handle.stop();
    }
}
