use crate::connection::Connection;
use crate::error::ProtocolError;
use crate::msg::field::process_fields;
use crate::msg::{Loc, Msg};
use serde_json::Value;
use tracing::{debug, warn};

/// A peer app participating in this engine's graph.
///
/// A remote starts weak while its channel is provisional (dialed but
/// not yet confirmed by the peer's start_graph result, or accepted
/// while a dial to the same peer races it). Confirmation promotes it
/// to normal membership; only normal remotes carry graph traffic.
pub struct Remote {
    uri: String,
    graph_id: String,
    connection: Option<Connection>,
    /// Override for where inbound from this remote should be routed
    /// instead of the message's own dest.
    explicit_dest_loc: Option<Loc>,
    closing: bool,
}

impl Remote {
    pub fn new(uri: &str, graph_id: &str, connection: Connection) -> Self {
        Self {
            uri: uri.to_string(),
            graph_id: graph_id.to_string(),
            connection: Some(connection),
            explicit_dest_loc: None,
            closing: false,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Pin everything arriving over this channel to one destination.
    pub fn set_explicit_dest_loc(&mut self, loc: Loc) {
        self.explicit_dest_loc = Some(loc);
    }

    pub fn connection(&self) -> Option<&Connection> {
        self.connection.as_ref()
    }

    pub fn connection_mut(&mut self) -> Option<&mut Connection> {
        self.connection.as_mut()
    }

    pub fn take_connection(&mut self) -> Option<Connection> {
        self.connection.take()
    }

    pub fn send_msg(&mut self, msg: &Msg) -> Result<(), ProtocolError> {
        match self.connection.as_mut() {
            Some(conn) => conn.send_msg(msg),
            None => Err(ProtocolError::Closed),
        }
    }

    /// Messages coming in over this channel speak for the remote app:
    /// their src uri is rewritten to the remote's uri, and the graph id
    /// is filled in so replies route within this graph.
    pub fn tag_inbound_src(&self, msg: &mut Msg) {
        let uri = self.uri.clone();
        let graph_id = self.graph_id.clone();
        let res = process_fields(msg, &mut |name, value, user_defined, changed| {
            if user_defined || name != "src" {
                return Ok(());
            }
            let mut loc: Loc = serde_json::from_value(value.clone())
                .map_err(|e| format!("src is not a location: {e}"))?;
            loc.app_uri = uri.clone();
            if loc.graph_id.is_empty() {
                loc.graph_id = graph_id.clone();
            }
            *value = serde_json::to_value(&loc).unwrap_or(Value::Null);
            *changed = true;
            Ok(())
        });
        if let Err(e) = res {
            warn!("[Remote] failed to tag inbound src from {}: {e}", self.uri);
        }
        if let Some(loc) = &self.explicit_dest_loc {
            msg.clear_and_set_dest(loc.clone());
        }
    }

    /// Downward close: the connection goes first; the remote is done
    /// when the connection's transport confirms.
    pub fn close(&mut self) -> bool {
        if self.closing {
            return false;
        }
        self.closing = true;
        match self.connection.as_mut() {
            Some(conn) => {
                conn.close();
                false
            }
            None => true,
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// The connection's transport reported closed. Returns true when
    /// the remote is fully torn down.
    pub fn on_connection_closed(&mut self) -> bool {
        if self.connection.take().is_some() {
            debug!("[Remote] connection to {} closed", self.uri);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::Loc;

    // Building a Remote needs a Connection, which needs a live
    // protocol; src tagging is the part testable in isolation.
    #[test]
    fn tag_rewrites_src_uri_and_graph() {
        let remote = Remote {
            uri: "mem://peer:1/".into(),
            graph_id: "g-1".into(),
            connection: None,
            explicit_dest_loc: None,
            closing: false,
        };

        let mut msg = Msg::cmd("hello");
        msg.src = Loc::default();
        remote.tag_inbound_src(&mut msg);
        assert_eq!(msg.src.app_uri, "mem://peer:1/");
        assert_eq!(msg.src.graph_id, "g-1");

        let mut msg2 = Msg::cmd("hello");
        msg2.src = Loc::graph("stale", "other-graph");
        remote.tag_inbound_src(&mut msg2);
        assert_eq!(msg2.src.app_uri, "mem://peer:1/");
        assert_eq!(msg2.src.graph_id, "other-graph");
    }

    #[test]
    fn explicit_dest_overrides_inbound_routing() {
        let mut remote = Remote {
            uri: "mem://peer:1/".into(),
            graph_id: "g-1".into(),
            connection: None,
            explicit_dest_loc: None,
            closing: false,
        };
        let pinned = Loc::extension("mem://self:1/", "g-1", "main", "sink");
        remote.set_explicit_dest_loc(pinned.clone());

        let mut msg = Msg::data("frame");
        msg.dests = vec![Loc::app("mem://elsewhere:1/"), Loc::app("mem://other:1/")];
        remote.tag_inbound_src(&mut msg);
        assert_eq!(msg.dests, vec![pinned]);
    }
}
