//! The dispatch funnel.
//!
//! Every routable message passes through `dispatch_msg`, which narrows
//! the single destination in order: another app, another graph on this
//! app, then a local extension. Multi-destination messages are split
//! into per-destination clones first.

use super::Engine;
use crate::connection::ConnId;
use crate::msg::{Msg, MsgType, StatusCode};
use tracing::{debug, warn};

impl Engine {
    pub(crate) fn dispatch_msg(&mut self, msg: Msg) {
        if msg.kind == MsgType::CmdResult && !msg.cmd_id.is_empty() {
            // Results answering a command that entered over a channel
            // leave through that channel, whatever their dest says.
            if let Some(path) = self.path_table.take_in_path(&msg.cmd_id) {
                self.answer_result(msg, path.src_conn);
                return;
            }
        }
        if msg.dests.is_empty() {
            warn!(
                "[Engine {}] {:?} '{}' has no destination, dropped",
                self.graph_id, msg.kind, msg.name
            );
            return;
        }
        if msg.dests.len() > 1 {
            for part in msg.split_dests() {
                self.dispatch_msg(part);
            }
            return;
        }

        let dest = msg.dests[0].clone();
        if !dest.app_uri.is_empty() && dest.app_uri != self.app_uri {
            self.send_to_remote(&dest.app_uri, msg);
            return;
        }
        if !dest.graph_id.is_empty() && dest.graph_id != self.graph_id {
            let app = self.app.clone();
            app.post(move |a| a.route_msg(msg));
            return;
        }
        self.deliver_local(msg);
    }

    fn send_to_remote(&mut self, uri: &str, msg: Msg) {
        // Only confirmed members carry routed traffic; a weak channel
        // may yet be torn down as a duplicate.
        if let Some(remote) = self.remotes.get_mut(uri) {
            if let Err(e) = remote.send_msg(&msg) {
                warn!("[Engine {}] send to {uri} failed: {e}", self.graph_id);
            }
            return;
        }
        // Not a graph member; the app may still know the uri (an
        // external client's reply channel, for instance).
        let app = self.app.clone();
        app.post(move |a| a.route_msg(msg));
    }

    fn deliver_local(&mut self, msg: Msg) {
        match self.extension_context.as_mut() {
            Some(ctx) => {
                if let Err(msg) = ctx.deliver(msg) {
                    self.reject_undeliverable(msg);
                }
            }
            None => self.reject_undeliverable(msg),
        }
    }

    fn reject_undeliverable(&mut self, msg: Msg) {
        if msg.kind.is_cmd_family() && msg.kind != MsgType::CmdResult {
            let dest = msg
                .dests
                .first()
                .map(|d| format!("{}/{}", d.extension_group, d.extension))
                .unwrap_or_default();
            let res = Msg::result_from(StatusCode::Error, &msg)
                .with_detail(&format!("destination not found: {dest}"));
            self.dispatch_msg(res);
        } else {
            // Media frames to a vanished extension arrive at frame
            // rate; keep the log readable.
            crate::debug_throttled!(
                std::time::Duration::from_secs(1),
                "[Engine {}] undeliverable {:?} '{}', dropped",
                self.graph_id,
                msg.kind,
                msg.name
            );
        }
    }

    /// The transport under a connection is gone. Depending on who held
    /// it, this finalizes a remote, fails an in-flight dial, or just
    /// discards an orphan.
    pub fn on_conn_transport_closed(&mut self, conn: ConnId) {
        if let Some(uri) = self.conn_remote.remove(&conn) {
            // Only remove the remote if it still owns this connection:
            // after a dial race the uri may have been rebound.
            let owns_weak = matches!(
                self.weak_remotes.get(&uri),
                Some(r) if r.connection().map(|c| c.id()) == Some(conn)
            );
            let was_weak = owns_weak && self.weak_remotes.remove(&uri).is_some();
            let owns_normal = matches!(
                self.remotes.get(&uri),
                Some(r) if r.connection().map(|c| c.id()) == Some(conn)
            );
            let was_normal = !was_weak && owns_normal && self.remotes.remove(&uri).is_some();
            if was_weak || was_normal {
                debug!("[Engine {}] channel to {uri} closed", self.graph_id);
            }
            if !self.is_closing {
                if was_weak {
                    self.fail_out_path(&uri, &format!("channel to {uri} closed during start"));
                } else if was_normal && !self.long_running_mode {
                    // A confirmed member dropping out takes the graph
                    // down with it.
                    self.close("remote channel closed");
                }
            }
        } else if let Some(c) = self.orphan_conns.remove(&conn) {
            if c.is_duplicate() {
                debug!(
                    "[Engine {}] duplicated channel {} confirmed down",
                    self.graph_id,
                    conn.simple()
                );
            } else {
                debug!(
                    "[Engine {}] connection {} closed",
                    self.graph_id,
                    conn.simple()
                );
            }
        }
        self.check_close_ready();
    }
}
