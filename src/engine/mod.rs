//! One engine runs one graph.
//!
//! An engine owns the remotes of its graph, the extension system
//! hosting the local extensions, and the path table correlating
//! commands with results. All state is touched only from the engine's
//! loop, which is either a dedicated thread or the app's, depending on
//! configuration; either way, other threads reach the engine through
//! posted tasks.

mod close;
mod route;
mod start_graph;
mod timer;

use crate::app::App;
use crate::config::ConnectRetryConfig;
use crate::connection::{AttachTo, ConnId, Connection};
use crate::extension::{ExtensionContext, ExtensionRegistry};
use crate::graph::GraphSpec;
use crate::io::swap::SwapQueue;
use crate::msg::{Loc, Msg, MsgType, Payload};
use crate::path::PathTable;
use crate::remote::Remote;
use crate::runloop::LoopHandle;
use crate::transport::Transport;
use crate::utils::CancelToken;
use ahash::AHashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

pub(crate) use timer::TimerEntry;

/// Where an engine's tasks run. `Own` engines have a dedicated loop;
/// `Shared` engines live inside the app's loop and are found there by
/// graph id.
pub enum EngineHandle {
    Own(LoopHandle<Engine>),
    Shared(LoopHandle<App>, String),
}

impl Clone for EngineHandle {
    fn clone(&self) -> Self {
        match self {
            EngineHandle::Own(h) => EngineHandle::Own(h.clone()),
            EngineHandle::Shared(h, gid) => EngineHandle::Shared(h.clone(), gid.clone()),
        }
    }
}

impl EngineHandle {
    pub fn post(&self, f: impl FnOnce(&mut Engine) + Send + 'static) -> bool {
        match self {
            EngineHandle::Own(h) => h.post(f),
            EngineHandle::Shared(h, gid) => {
                let gid = gid.clone();
                h.post(move |app| match app.shared_engine_mut(&gid) {
                    Some(engine) => f(engine),
                    None => debug!("[EngineHandle] engine {gid} is gone, task dropped"),
                })
            }
        }
    }

    pub fn post_delayed(&self, after: Duration, f: impl FnOnce(&mut Engine) + Send + 'static) -> bool {
        match self {
            EngineHandle::Own(h) => h.post_delayed(after, f),
            EngineHandle::Shared(h, gid) => {
                let gid = gid.clone();
                h.post_delayed(after, move |app| match app.shared_engine_mut(&gid) {
                    Some(engine) => f(engine),
                    None => debug!("[EngineHandle] engine {gid} is gone, timer dropped"),
                })
            }
        }
    }
}

pub struct Engine {
    app_uri: String,
    graph_id: String,
    app: LoopHandle<App>,
    handle: EngineHandle,
    cancel: CancelToken,
    transport: Arc<dyn Transport>,
    registry: Arc<ExtensionRegistry>,
    retry_cfg: ConnectRetryConfig,
    /// Losing a remote normally takes the whole graph down; a long
    /// running engine shrugs it off.
    long_running_mode: bool,

    /// Confirmed graph members, keyed by app uri.
    remotes: AHashMap<String, Remote>,
    /// Dialed but not yet confirmed by the peer's start_graph result.
    weak_remotes: AHashMap<String, Remote>,
    /// Connections handed over by the app that are not (or not yet)
    /// remote channels.
    orphan_conns: AHashMap<ConnId, Connection>,
    conn_remote: AHashMap<ConnId, String>,
    /// start_graph clones waiting for their channel to come up.
    pending_out: AHashMap<String, Msg>,

    in_msgs: SwapQueue<(Msg, Option<ConnId>)>,
    extension_msgs: SwapQueue<Msg>,
    path_table: PathTable,
    timers: AHashMap<u32, TimerEntry>,
    extension_context: Option<ExtensionContext>,

    graph: Option<GraphSpec>,
    original_start_graph: Option<(Msg, Option<ConnId>)>,
    /// A stop_graph aimed at this graph, kept (with its source
    /// connection) until the teardown completes and the app answers it.
    stashed_stop_graph: Option<(Msg, Option<ConnId>)>,

    is_ready: bool,
    is_closing: bool,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        app_uri: &str,
        graph_id: &str,
        app: LoopHandle<App>,
        handle: EngineHandle,
        cancel: CancelToken,
        transport: Arc<dyn Transport>,
        registry: Arc<ExtensionRegistry>,
        retry_cfg: ConnectRetryConfig,
    ) -> Self {
        Self {
            app_uri: app_uri.to_string(),
            graph_id: graph_id.to_string(),
            app,
            handle,
            cancel,
            transport,
            registry,
            retry_cfg,
            long_running_mode: false,
            remotes: AHashMap::new(),
            weak_remotes: AHashMap::new(),
            orphan_conns: AHashMap::new(),
            conn_remote: AHashMap::new(),
            pending_out: AHashMap::new(),
            in_msgs: SwapQueue::new(),
            extension_msgs: SwapQueue::new(),
            path_table: PathTable::new(),
            timers: AHashMap::new(),
            extension_context: None,
            graph: None,
            original_start_graph: None,
            stashed_stop_graph: None,
            is_ready: false,
            is_closing: false,
        }
    }

    pub fn graph_id(&self) -> &str {
        &self.graph_id
    }

    pub fn is_ready(&self) -> bool {
        self.is_ready
    }

    /// Entry point for messages forwarded by the app.
    pub fn enqueue(&mut self, msg: Msg, src_conn: Option<ConnId>) {
        self.in_msgs.push((msg, src_conn));
        self.process_in_msgs();
    }

    /// Take ownership of a connection migrated from the app. Messages
    /// staged behind the migrating one surfaced wakeups that landed on
    /// the old owner, so the inbox is drained right away.
    pub fn adopt_connection(&mut self, conn: Connection) {
        conn.set_attach(AttachTo::Engine);
        let id = conn.id();
        self.orphan_conns.insert(id, conn);
        self.on_conn_inbound(id);
    }

    /// Wakeup from a reader thread: a connection has buffered inbound.
    pub fn on_conn_inbound(&mut self, conn: ConnId) {
        let msgs = self.drain_conn(conn);
        for msg in msgs {
            self.in_msgs.push((msg, Some(conn)));
        }
        self.process_in_msgs();
    }

    /// Single-message variant used when a first message surfaces after
    /// the connection already migrated here.
    pub fn on_conn_inbound_push(&mut self, conn: ConnId, mut msg: Msg) {
        if let Some(uri) = self.conn_remote.get(&conn) {
            let uri = uri.clone();
            if let Some(remote) = self.any_remote(&uri) {
                remote.tag_inbound_src(&mut msg);
            }
        }
        self.in_msgs.push((msg, Some(conn)));
        self.process_in_msgs();
    }

    fn drain_conn(&mut self, conn: ConnId) -> Vec<Msg> {
        if let Some(uri) = self.conn_remote.get(&conn) {
            let uri = uri.clone();
            // A dial race can briefly leave two channels mapped to the
            // same uri, so the remote must be matched by connection id.
            let remote = match self.remotes.get_mut(&uri) {
                Some(r) if r.connection().map(|c| c.id()) == Some(conn) => Some(r),
                _ => match self.weak_remotes.get_mut(&uri) {
                    Some(r) if r.connection().map(|c| c.id()) == Some(conn) => Some(r),
                    _ => None,
                },
            };
            return match remote {
                Some(r) => {
                    let mut out = match r.connection_mut() {
                        Some(c) => c.drain_inbound(),
                        None => Vec::new(),
                    };
                    for msg in out.iter_mut() {
                        r.tag_inbound_src(msg);
                    }
                    out
                }
                None => Vec::new(),
            };
        }
        match self.orphan_conns.get_mut(&conn) {
            Some(c) => {
                let external = matches!(
                    c.protocol_mut().role(),
                    crate::protocol::ProtocolRole::InExternal
                        | crate::protocol::ProtocolRole::OutExternal
                );
                let mut out = c.drain_inbound();
                if external {
                    for msg in out.iter_mut() {
                        if msg.kind.is_cmd_family() && msg.kind != MsgType::CmdResult {
                            msg.ensure_cmd_id();
                        }
                    }
                }
                out
            }
            None => Vec::new(),
        }
    }

    fn any_remote(&self, uri: &str) -> Option<&Remote> {
        self.remotes.get(uri).or_else(|| self.weak_remotes.get(uri))
    }

    /// Drain the inbox. Before the graph is up only start_graph and
    /// results are actionable; everything else waits at the front of
    /// the queue in arrival order.
    pub(crate) fn process_in_msgs(&mut self) {
        let mut batch = self.in_msgs.swap_out();
        let mut deferred: VecDeque<(Msg, Option<ConnId>)> = VecDeque::new();

        while let Some((msg, src_conn)) = batch.pop_front() {
            if self.is_closing && !closing_allows(msg.kind) {
                debug!(
                    "[Engine {}] dropping {:?} '{}' while closing",
                    self.graph_id, msg.kind, msg.name
                );
                continue;
            }
            if !self.is_ready
                && !matches!(msg.kind, MsgType::CmdStartGraph | MsgType::CmdResult)
            {
                deferred.push_back((msg, src_conn));
                continue;
            }
            self.handle_msg(msg, src_conn);
            if self.is_ready && !deferred.is_empty() {
                // The gate opened mid-batch; release what was held, in
                // arrival order, ahead of the rest of the batch.
                while let Some(item) = deferred.pop_back() {
                    batch.push_front(item);
                }
            }
        }

        self.in_msgs.requeue_front(deferred);
    }

    fn handle_msg(&mut self, msg: Msg, src_conn: Option<ConnId>) {
        match msg.kind {
            MsgType::CmdStartGraph => self.handle_start_graph(msg, src_conn),
            MsgType::CmdResult => self.handle_cmd_result(msg),
            MsgType::CmdStopGraph => self.handle_stop_graph(msg, src_conn),
            MsgType::CmdTimer => self.handle_timer_cmd(msg),
            MsgType::CmdCloseApp => {
                let app = self.app.clone();
                app.post(move |a| a.enqueue(msg));
            }
            _ => {
                // Commands entering over a channel leave an in-path so
                // their eventual result travels back the same way.
                if msg.kind.is_cmd_family() && src_conn.is_some() {
                    self.path_table.create_in_path(msg.clone(), src_conn);
                }
                self.dispatch_msg(msg);
            }
        }
    }

    fn handle_stop_graph(&mut self, msg: Msg, src_conn: Option<ConnId>) {
        let target = match &msg.payload {
            Payload::StopGraph { graph_id } => graph_id.clone(),
            _ => String::new(),
        };
        if !target.is_empty() && target != self.graph_id {
            // Another graph owns this command. Remember the reply path,
            // speak as this engine, and let the app find the owner.
            if src_conn.is_some() {
                self.path_table.create_in_path(msg.clone(), src_conn);
            }
            let mut fwd = msg;
            fwd.src = Loc::graph(&self.app_uri, &self.graph_id);
            let app = self.app.clone();
            app.post(move |a| a.enqueue(fwd));
            return;
        }
        // The engine that carries the command dies with it; the app
        // answers once the teardown completes.
        self.stashed_stop_graph = Some((msg, src_conn));
        self.close("stop_graph");
    }

    /// Drain commands and data handed over by local extensions.
    pub fn process_extension_msgs(&mut self) {
        let batch = self.extension_msgs.swap_out();
        for mut msg in batch {
            if msg.kind.is_cmd_family()
                && msg.kind != MsgType::CmdResult
                && msg.cmd_id.is_empty()
            {
                msg.cmd_id = Uuid::new_v4().simple().to_string();
            }
            match msg.kind {
                MsgType::CmdTimer => self.handle_timer_cmd(msg),
                MsgType::CmdStopGraph => self.handle_stop_graph(msg, None),
                MsgType::CmdCloseApp => {
                    let app = self.app.clone();
                    app.post(move |a| a.enqueue(msg));
                }
                MsgType::CmdResult => self.handle_cmd_result(msg),
                _ => self.dispatch_msg(msg),
            }
        }
    }

    fn enable_extension_system(&mut self) -> Result<(), crate::error::GraphError> {
        let graph = match &self.graph {
            Some(g) => g.clone(),
            None => return Ok(()),
        };
        let ctx = ExtensionContext::start(
            &graph,
            &self.app_uri,
            &self.graph_id,
            &self.registry,
            self.extension_msgs.clone(),
            self.handle.clone(),
            &self.cancel,
        )?;
        self.extension_context = Some(ctx);
        Ok(())
    }

    /// Answer a command that arrived over `src_conn`, or hand the
    /// result to the app when the command came from inside.
    fn answer_result(&mut self, res: Msg, src_conn: Option<ConnId>) {
        if let Some(cid) = src_conn {
            if let Some(uri) = self.conn_remote.get(&cid) {
                let uri = uri.clone();
                if self.try_send_remote(&uri, &res) {
                    return;
                }
            }
            if let Some(conn) = self.orphan_conns.get_mut(&cid) {
                if let Err(e) = conn.send_msg(&res) {
                    warn!("[Engine {}] failed to answer over {}: {e}", self.graph_id, cid.simple());
                }
                return;
            }
        }
        let app = self.app.clone();
        app.post(move |a| a.route_msg(res));
    }

    /// Send over whichever remote currently owns the channel. Unlike
    /// routed traffic, an answer may legitimately leave over a channel
    /// that is still weak.
    fn try_send_remote(&mut self, uri: &str, msg: &Msg) -> bool {
        let remote = match self.remotes.get_mut(uri) {
            Some(r) => Some(r),
            None => self.weak_remotes.get_mut(uri),
        };
        match remote {
            Some(r) => {
                if let Err(e) = r.send_msg(msg) {
                    warn!("[Engine {}] send to {uri} failed: {e}", self.graph_id);
                }
                true
            }
            None => false,
        }
    }
}

/// The message kinds a closing engine or app still processes.
pub(crate) fn closing_allows(kind: MsgType) -> bool {
    matches!(
        kind,
        MsgType::CmdCloseApp
            | MsgType::CmdStopGraph
            | MsgType::CmdStartGraph
            | MsgType::CmdTimer
            | MsgType::CmdTimeout
            | MsgType::CmdResult
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_cmds_pass_the_closing_gate() {
        for kind in [
            MsgType::CmdCloseApp,
            MsgType::CmdStopGraph,
            MsgType::CmdStartGraph,
            MsgType::CmdTimer,
            MsgType::CmdTimeout,
            MsgType::CmdResult,
        ] {
            assert!(closing_allows(kind));
        }
        assert!(!closing_allows(MsgType::Cmd));
        assert!(!closing_allows(MsgType::Data));
        assert!(!closing_allows(MsgType::VideoFrame));
    }
}
