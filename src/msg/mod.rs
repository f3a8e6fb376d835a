pub mod codec;
pub mod field;

use crate::graph::GraphSpec;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Reserved `detail` value marking the benign teardown of a duplicated
/// channel between two engines.
pub const DETAIL_DUPLICATE: &str = "duplicate";

/// Property key for the human-readable result detail.
pub const PROP_DETAIL: &str = "detail";

/// Full address of a message endpoint. Empty segments mean "not
/// narrowed to that level": an app-only Loc addresses the app itself.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Loc {
    #[serde(default)]
    pub app_uri: String,
    #[serde(default)]
    pub graph_id: String,
    #[serde(default)]
    pub extension_group: String,
    #[serde(default)]
    pub extension: String,
}

impl Loc {
    pub fn app(uri: &str) -> Self {
        Self {
            app_uri: uri.to_string(),
            ..Default::default()
        }
    }

    pub fn graph(uri: &str, graph_id: &str) -> Self {
        Self {
            app_uri: uri.to_string(),
            graph_id: graph_id.to_string(),
            ..Default::default()
        }
    }

    pub fn extension(uri: &str, graph_id: &str, group: &str, extension: &str) -> Self {
        Self {
            app_uri: uri.to_string(),
            graph_id: graph_id.to_string(),
            extension_group: group.to_string(),
            extension: extension.to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.app_uri.is_empty()
            && self.graph_id.is_empty()
            && self.extension_group.is_empty()
            && self.extension.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgType {
    Cmd,
    CmdResult,
    CmdStartGraph,
    CmdStopGraph,
    CmdCloseApp,
    CmdTimer,
    CmdTimeout,
    Data,
    VideoFrame,
    AudioFrame,
}

impl MsgType {
    /// Command-family messages carry cmd ids and expect results.
    pub fn is_cmd_family(self) -> bool {
        matches!(
            self,
            MsgType::Cmd
                | MsgType::CmdResult
                | MsgType::CmdStartGraph
                | MsgType::CmdStopGraph
                | MsgType::CmdCloseApp
                | MsgType::CmdTimer
                | MsgType::CmdTimeout
        )
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    Ok,
    Error,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StartGraphPayload {
    /// Name of a graph predefined in the app's config; filled into
    /// `graph` by the first app that handles the command and stripped
    /// before the command is forwarded to other apps.
    #[serde(default)]
    pub predefined_graph_name: String,
    #[serde(default)]
    pub long_running_mode: bool,
    #[serde(default)]
    pub graph: GraphSpec,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TimerPayload {
    pub timer_id: u32,
    pub timeout_us: u64,
    /// Number of timeouts to fire; <= 0 means until stopped.
    pub times: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultPayload {
    pub status: StatusCode,
    pub original_cmd_type: MsgType,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    Empty,
    StartGraph(Box<StartGraphPayload>),
    StopGraph {
        #[serde(default)]
        graph_id: String,
    },
    Timer(TimerPayload),
    Timeout {
        timer_id: u32,
    },
    Result(ResultPayload),
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Empty
    }
}

/// The message envelope every entity in the runtime exchanges.
///
/// Messages move by value; fan-out clones. `properties` is the
/// user-defined tree; everything else is runtime-owned.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Msg {
    #[serde(rename = "type")]
    pub kind: MsgType,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub src: Loc,
    #[serde(default)]
    pub dests: Vec<Loc>,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default)]
    pub cmd_id: String,
    #[serde(default)]
    pub parent_cmd_id: String,
    #[serde(default)]
    pub payload: Payload,
}

impl Msg {
    pub fn new(kind: MsgType, name: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
            src: Loc::default(),
            dests: Vec::new(),
            properties: Map::new(),
            cmd_id: String::new(),
            parent_cmd_id: String::new(),
            payload: Payload::Empty,
        }
    }

    pub fn cmd(name: &str) -> Self {
        Self::new(MsgType::Cmd, name)
    }

    pub fn data(name: &str) -> Self {
        Self::new(MsgType::Data, name)
    }

    pub fn start_graph(payload: StartGraphPayload) -> Self {
        let mut msg = Self::new(MsgType::CmdStartGraph, "start_graph");
        msg.payload = Payload::StartGraph(Box::new(payload));
        msg
    }

    pub fn stop_graph(graph_id: &str) -> Self {
        let mut msg = Self::new(MsgType::CmdStopGraph, "stop_graph");
        msg.payload = Payload::StopGraph {
            graph_id: graph_id.to_string(),
        };
        msg
    }

    pub fn close_app() -> Self {
        Self::new(MsgType::CmdCloseApp, "close_app")
    }

    pub fn timer(timer_id: u32, timeout_us: u64, times: i64) -> Self {
        let mut msg = Self::new(MsgType::CmdTimer, "timer");
        msg.payload = Payload::Timer(TimerPayload {
            timer_id,
            timeout_us,
            times,
        });
        msg
    }

    pub fn timeout(timer_id: u32) -> Self {
        let mut msg = Self::new(MsgType::CmdTimeout, "timeout");
        msg.payload = Payload::Timeout { timer_id };
        msg
    }

    /// Build a result answering `orig`: same cmd id, destination is the
    /// original source.
    pub fn result_from(status: StatusCode, orig: &Msg) -> Self {
        let mut msg = Self::new(MsgType::CmdResult, "");
        msg.cmd_id = orig.cmd_id.clone();
        msg.parent_cmd_id = orig.parent_cmd_id.clone();
        msg.dests = vec![orig.src.clone()];
        msg.payload = Payload::Result(ResultPayload {
            status,
            original_cmd_type: orig.kind,
        });
        msg
    }

    pub fn with_detail(mut self, detail: &str) -> Self {
        self.set_detail(detail);
        self
    }

    pub fn set_detail(&mut self, detail: &str) {
        self.properties
            .insert(PROP_DETAIL.to_string(), Value::String(detail.to_string()));
    }

    pub fn detail(&self) -> Option<&str> {
        self.properties.get(PROP_DETAIL).and_then(Value::as_str)
    }

    pub fn status(&self) -> Option<StatusCode> {
        match &self.payload {
            Payload::Result(r) => Some(r.status),
            _ => None,
        }
    }

    /// Rewrite the status of a result message; no-op for other kinds.
    pub fn set_status(&mut self, status: StatusCode) {
        if let Payload::Result(r) = &mut self.payload {
            r.status = status;
        }
    }

    /// A command entering the runtime from outside carries no id yet.
    /// It gets a fresh one, and its src uri is set to that id so the
    /// answer can be routed back to the originating channel.
    pub fn ensure_cmd_id(&mut self) -> &str {
        if self.cmd_id.is_empty() {
            self.cmd_id = Uuid::new_v4().simple().to_string();
            self.src.app_uri = self.cmd_id.clone();
        }
        &self.cmd_id
    }

    /// True if this command originated outside the runtime; holds
    /// exactly when `src.app_uri == cmd_id`.
    pub fn is_external_origin(&self) -> bool {
        !self.cmd_id.is_empty() && self.src.app_uri == self.cmd_id
    }

    pub fn clear_and_set_dest(&mut self, dest: Loc) {
        self.dests.clear();
        self.dests.push(dest);
    }

    /// Split a multi-destination message into one clone per
    /// destination. Clones keep the cmd id, so their results correlate
    /// to the same path group.
    pub fn split_dests(&self) -> Vec<Msg> {
        self.dests
            .iter()
            .map(|dest| {
                let mut clone = self.clone();
                clone.dests = vec![dest.clone()];
                clone
            })
            .collect()
    }

    pub fn start_graph_payload(&self) -> Option<&StartGraphPayload> {
        match &self.payload {
            Payload::StartGraph(p) => Some(p),
            _ => None,
        }
    }

    pub fn start_graph_payload_mut(&mut self) -> Option<&mut StartGraphPayload> {
        match &mut self.payload {
            Payload::StartGraph(p) => Some(p),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn external_cmd_gets_id_equal_to_src_uri() {
        let mut cmd = Msg::cmd("do_it");
        assert!(!cmd.is_external_origin());

        cmd.ensure_cmd_id();
        assert!(!cmd.cmd_id.is_empty());
        assert_eq!(cmd.src.app_uri, cmd.cmd_id);
        assert!(cmd.is_external_origin());

        // A second call must not reissue the id.
        let id = cmd.cmd_id.clone();
        cmd.ensure_cmd_id();
        assert_eq!(cmd.cmd_id, id);
    }

    #[test]
    fn internal_cmd_is_not_external() {
        let mut cmd = Msg::cmd("do_it");
        cmd.cmd_id = "some-id".into();
        cmd.src = Loc::graph("mem://a:1/", "g1");
        assert!(!cmd.is_external_origin());
    }

    #[test]
    fn result_answers_original_source() {
        let mut cmd = Msg::stop_graph("g1");
        cmd.ensure_cmd_id();
        cmd.src = Loc::graph("mem://a:1/", "g2");

        let res = Msg::result_from(StatusCode::Ok, &cmd).with_detail("close engine done");
        assert_eq!(res.kind, MsgType::CmdResult);
        assert_eq!(res.cmd_id, cmd.cmd_id);
        assert_eq!(res.dests, vec![cmd.src.clone()]);
        assert_eq!(res.detail(), Some("close engine done"));
        assert_eq!(res.status(), Some(StatusCode::Ok));
        match res.payload {
            Payload::Result(r) => assert_eq!(r.original_cmd_type, MsgType::CmdStopGraph),
            _ => panic!("expected result payload"),
        }
    }

    #[test]
    fn split_dests_keeps_cmd_id() {
        let mut cmd = Msg::cmd("fan");
        cmd.ensure_cmd_id();
        cmd.dests = vec![Loc::app("mem://b:1/"), Loc::app("mem://c:1/")];

        let parts = cmd.split_dests();
        assert_eq!(parts.len(), 2);
        for part in &parts {
            assert_eq!(part.cmd_id, cmd.cmd_id);
            assert_eq!(part.dests.len(), 1);
        }
        assert_eq!(parts[0].dests[0].app_uri, "mem://b:1/");
        assert_eq!(parts[1].dests[0].app_uri, "mem://c:1/");
    }
}
