//! Engine teardown.
//!
//! Closing is always asynchronous: the request flips a flag and posts a
//! fresh task, so whatever call stack noticed the trigger unwinds
//! first. The engine is done when its timers, extension system and
//! connections are all gone; only then does it tell the app.

use super::Engine;
use crate::engine::EngineHandle;
use tracing::{debug, info};

impl Engine {
    pub fn close(&mut self, reason: &str) {
        if self.is_closing {
            return;
        }
        self.is_closing = true;
        info!("[Engine {}] closing: {reason}", self.graph_id);
        let handle = self.handle.clone();
        handle.post(|engine| engine.do_close());
    }

    pub fn is_closing(&self) -> bool {
        self.is_closing
    }

    fn do_close(&mut self) {
        self.timers.clear();
        self.pending_out.clear();
        if let Some(mut ctx) = self.extension_context.take() {
            ctx.close();
        }

        let done: Vec<String> = self
            .remotes
            .iter_mut()
            .filter_map(|(uri, r)| r.close().then(|| uri.clone()))
            .collect();
        for uri in done {
            self.remotes.remove(&uri);
        }
        let done: Vec<String> = self
            .weak_remotes
            .iter_mut()
            .filter_map(|(uri, r)| r.close().then(|| uri.clone()))
            .collect();
        for uri in done {
            self.weak_remotes.remove(&uri);
        }
        let keep = self.stashed_stop_graph.as_ref().and_then(|(_, c)| *c);
        for (id, conn) in self.orphan_conns.iter_mut() {
            // The stop_graph requester's channel survives the teardown
            // to carry the final result.
            if Some(*id) != keep {
                conn.close();
            }
        }

        self.check_close_ready();
    }

    /// Re-checked after every async teardown confirmation.
    pub(crate) fn check_close_ready(&mut self) {
        if !self.is_closing {
            return;
        }
        let keep = self.stashed_stop_graph.as_ref().and_then(|(_, c)| *c);
        let ready = self.timers.is_empty()
            && self.extension_context.is_none()
            && self.remotes.is_empty()
            && self.weak_remotes.is_empty()
            && self.orphan_conns.keys().all(|id| Some(*id) == keep);
        if !ready {
            debug!(
                "[Engine {}] not ready to finalize: {} remote(s), {} weak, {} orphan(s), {} timer(s)",
                self.graph_id,
                self.remotes.len(),
                self.weak_remotes.len(),
                self.orphan_conns.len(),
                self.timers.len()
            );
            return;
        }

        info!("[Engine {}] closed", self.graph_id);
        let graph_id = self.graph_id.clone();
        let (stashed, reply_conn) = match self.stashed_stop_graph.take() {
            Some((cmd, cid)) => {
                let conn = cid.and_then(|c| self.orphan_conns.remove(&c));
                (Some(cmd), conn)
            }
            None => (None, None),
        };
        let app = self.app.clone();
        app.post(move |a| a.on_engine_closed(graph_id, stashed, reply_conn));
        if let EngineHandle::Own(h) = &self.handle {
            h.stop();
        }
    }
}
