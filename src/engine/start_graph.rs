//! Graph bring-up.
//!
//! The first start_graph an engine sees pins the graph: the engine
//! dials every member app it has no channel to yet, fans a clone of
//! the command to each, and folds the results into one verdict. Later
//! start_graphs arriving over fresh channels just confirm membership,
//! unless the channel duplicates one this engine is already dialing.

use super::Engine;
use crate::connection::{AttachTo, ConnId, MigrationState};
use crate::error::ConnectError;
use crate::msg::{Loc, Msg, MsgType, Payload, ResultPayload, StatusCode, DETAIL_DUPLICATE};
use crate::path::{PathGroupPolicy, PathResolution};
use crate::protocol::integrated::IntegratedProtocol;
use crate::protocol::{ConnectedFn, MsgSink, Protocol, ProtocolRole};
use crate::remote::Remote;
use crate::utils::uri::Uri;
use std::mem;
use tracing::{debug, info, warn};

impl Engine {
    pub(super) fn handle_start_graph(&mut self, mut cmd: Msg, src_conn: Option<ConnId>) {
        let peer_uri = cmd.src.app_uri.clone();
        let from_peer = src_conn.is_some() && !cmd.is_external_origin() && !peer_uri.is_empty();

        if from_peer {
            if self.is_duplicated_channel(&peer_uri) {
                self.reject_duplicate(&cmd, src_conn);
                return;
            }
            self.adopt_peer_channel(&peer_uri, src_conn);
        }

        if self.graph.is_some() {
            // Graph already pinned; this channel only joins it.
            let res = Msg::result_from(StatusCode::Ok, &cmd).with_detail("");
            self.answer_result(res, src_conn);
            return;
        }

        let payload = match cmd.start_graph_payload_mut() {
            Some(p) => p,
            None => {
                let res = Msg::result_from(StatusCode::Error, &cmd)
                    .with_detail("start_graph without a graph payload");
                self.answer_result(res, src_conn);
                return;
            }
        };
        // The name was resolved by the first app; peers get the graph.
        payload.predefined_graph_name.clear();
        self.long_running_mode |= payload.long_running_mode;

        let mut graph = payload.graph.clone();
        if let Err(e) = graph.normalize() {
            let res = Msg::result_from(StatusCode::Error, &cmd).with_detail(&e.to_string());
            self.answer_result(res, src_conn);
            self.close("malformed graph");
            return;
        }

        let targets: Vec<String> = graph
            .remote_uris(&self.app_uri)
            .into_iter()
            .filter(|u| !self.remotes.contains_key(u) && !self.weak_remotes.contains_key(u))
            .collect();

        info!(
            "[Engine {}] starting graph, {} node(s), {} peer(s) to dial",
            self.graph_id,
            graph.nodes.len(),
            targets.len()
        );

        self.graph = Some(graph);
        self.original_start_graph = Some((cmd.clone(), src_conn));

        if targets.is_empty() {
            self.finish_start_graph("");
            return;
        }

        self.path_table.create_out_group(
            cmd.clone(),
            src_conn,
            targets.clone(),
            PathGroupPolicy::FirstErrorOrLastOk,
        );
        for uri in targets {
            if let Err(e) = self.connect_remote(&uri, &cmd) {
                let (orig, orig_conn) = match self.original_start_graph.clone() {
                    Some(x) => x,
                    None => return,
                };
                let res =
                    Msg::result_from(StatusCode::Error, &orig).with_detail(&e.to_string());
                self.answer_result(res, orig_conn);
                self.close("connect failed");
                return;
            }
        }
    }

    /// An incoming channel from `peer` duplicates one we are dialing
    /// when the peer's uri does not exceed ours: exactly one side of
    /// the race keeps its outgoing channel.
    fn is_duplicated_channel(&self, peer: &str) -> bool {
        self.weak_remotes.contains_key(peer) && peer <= self.app_uri.as_str()
    }

    fn reject_duplicate(&mut self, cmd: &Msg, src_conn: Option<ConnId>) {
        let cid = match src_conn {
            Some(c) => c,
            None => return,
        };
        debug!(
            "[Engine {}] closing duplicated channel from {}",
            self.graph_id, cmd.src.app_uri
        );
        if let Some(mut conn) = self.orphan_conns.remove(&cid) {
            conn.mark_duplicate();
            let res =
                Msg::result_from(StatusCode::Error, cmd).with_detail(DETAIL_DUPLICATE);
            if let Err(e) = conn.send_msg(&res) {
                debug!("[Engine {}] duplicate reply not sent: {e}", self.graph_id);
            }
            conn.close();
            // Held until the transport confirms the teardown.
            self.orphan_conns.insert(cid, conn);
        }
    }

    /// Turn the channel the start_graph arrived over into the normal
    /// remote for its peer.
    fn adopt_peer_channel(&mut self, peer: &str, src_conn: Option<ConnId>) {
        let cid = match src_conn {
            Some(c) => c,
            None => return,
        };
        if let Some(mut conn) = self.orphan_conns.remove(&cid) {
            conn.set_remote_uri(peer);
            conn.set_attach(AttachTo::Remote);
            self.conn_remote.insert(cid, peer.to_string());
            self.remotes
                .insert(peer.to_string(), Remote::new(peer, &self.graph_id, conn));
        }
    }

    fn connect_remote(&mut self, uri_str: &str, cmd: &Msg) -> Result<(), ConnectError> {
        let uri = Uri::parse(uri_str)
            .map_err(|_| ConnectError::BadUri(uri_str.to_string()))?;

        let sink = MsgSink::Engine(self.handle.clone());
        let mut protocol =
            IntegratedProtocol::connecting(ProtocolRole::OutInternal, sink, &self.cancel);
        // Outgoing channels never migrate; inbound flows here directly.
        if let Err(e) = protocol.advance_migration(MigrationState::Done) {
            warn!("[Engine {}] {e}", self.graph_id);
        }
        let conn_id = protocol.conn_id();
        let mut conn = crate::connection::Connection::new(Box::new(protocol));
        conn.set_remote_uri(uri_str);
        conn.set_attach(AttachTo::Remote);

        let handle = self.handle.clone();
        let target = uri_str.to_string();
        let on_connected: ConnectedFn = Box::new(move |ok| {
            handle.post(move |engine| {
                if ok {
                    engine.on_remote_connected(target);
                } else {
                    engine.on_remote_connect_failed(target);
                }
            });
        });
        conn.protocol_mut()
            .connect_to(
                self.transport.clone(),
                &uri,
                &self.retry_cfg,
                &self.cancel,
                on_connected,
            )
            .map_err(|_| ConnectError::Refused(uri_str.to_string()))?;

        let mut clone = cmd.clone();
        clone.src = Loc::graph(&self.app_uri, &self.graph_id);
        clone.clear_and_set_dest(Loc::app(uri_str));
        if let Some(p) = clone.start_graph_payload_mut() {
            p.predefined_graph_name.clear();
        }
        self.pending_out.insert(uri_str.to_string(), clone);

        self.conn_remote.insert(conn_id, uri_str.to_string());
        self.weak_remotes
            .insert(uri_str.to_string(), Remote::new(uri_str, &self.graph_id, conn));
        Ok(())
    }

    pub(crate) fn on_remote_connected(&mut self, uri: String) {
        let pending = self.pending_out.remove(&uri);
        match (self.weak_remotes.get_mut(&uri), pending) {
            (Some(remote), Some(msg)) => {
                debug!("[Engine {}] channel to {uri} is up", self.graph_id);
                if let Err(e) = remote.send_msg(&msg) {
                    warn!("[Engine {}] start_graph to {uri} failed: {e}", self.graph_id);
                    self.fail_out_path(&uri, &format!("send to {uri} failed: {e}"));
                }
            }
            _ => debug!(
                "[Engine {}] connect to {uri} completed with nothing pending",
                self.graph_id
            ),
        }
    }

    pub(crate) fn on_remote_connect_failed(&mut self, uri: String) {
        self.pending_out.remove(&uri);
        let detail = ConnectError::RetriesExhausted {
            uri: uri.clone(),
            attempts: self.retry_cfg.max_attempts(),
        }
        .to_string();
        self.fail_out_path(&uri, &detail);
    }

    /// Feed a locally-synthesized ERROR into the path table, as if the
    /// peer had answered.
    pub(super) fn fail_out_path(&mut self, uri: &str, detail: &str) {
        let cmd_id = match self.original_start_graph.as_ref() {
            Some((cmd, _)) => cmd.cmd_id.clone(),
            None => return,
        };
        let mut res = Msg::new(MsgType::CmdResult, "");
        res.cmd_id = cmd_id;
        res.payload = Payload::Result(ResultPayload {
            status: StatusCode::Error,
            original_cmd_type: MsgType::CmdStartGraph,
        });
        res.set_detail(detail);
        self.apply_path_result(uri, res);
    }

    pub(super) fn handle_cmd_result(&mut self, msg: Msg) {
        let from_uri = msg.src.app_uri.clone();
        self.apply_path_result(&from_uri, msg);
    }

    pub(super) fn apply_path_result(&mut self, from_uri: &str, res: Msg) {
        match self.path_table.on_result(from_uri, res) {
            PathResolution::Pending => {}
            PathResolution::Unmatched(msg) => {
                if msg.dests.is_empty() {
                    debug!(
                        "[Engine {}] discarding unroutable result, cmd_id: {}",
                        self.graph_id, msg.cmd_id
                    );
                } else {
                    self.dispatch_msg(msg);
                }
            }
            PathResolution::Resolved { verdict, .. } => {
                if verdict.status() == Some(StatusCode::Ok) {
                    self.finish_start_graph(verdict.detail().unwrap_or(""));
                } else {
                    let (orig, src_conn) = match self.original_start_graph.clone() {
                        Some(x) => x,
                        None => return,
                    };
                    let res = Msg::result_from(StatusCode::Error, &orig)
                        .with_detail(verdict.detail().unwrap_or("start_graph failed"));
                    self.answer_result(res, src_conn);
                    self.close("start_graph failed");
                }
            }
        }
    }

    /// Every peer is in (or there were none): confirm the weak remotes,
    /// bring the extension system up, answer the original command and
    /// release anything the ready-gate deferred.
    pub(super) fn finish_start_graph(&mut self, detail: &str) {
        let weaks = mem::take(&mut self.weak_remotes);
        for (uri, mut remote) in weaks {
            if self.remotes.contains_key(&uri) {
                // Lost the dial race: the accepted channel to this peer
                // is canonical, so the dialed one goes away.
                remote.close();
                self.weak_remotes.insert(uri, remote);
            } else {
                self.remotes.insert(uri, remote);
            }
        }

        let (orig, src_conn) = match self.original_start_graph.clone() {
            Some(x) => x,
            None => return,
        };
        match self.enable_extension_system() {
            Ok(()) => {
                self.is_ready = true;
                info!("[Engine {}] graph is up", self.graph_id);
                let res = Msg::result_from(StatusCode::Ok, &orig).with_detail(detail);
                self.answer_result(res, src_conn);
                self.process_in_msgs();
            }
            Err(e) => {
                let res = Msg::result_from(StatusCode::Error, &orig).with_detail(&e.to_string());
                self.answer_result(res, src_conn);
                self.close("extension system failed to start");
            }
        }
    }
}
