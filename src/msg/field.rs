//! Per-type field registry.
//!
//! Every runtime-owned field of a message is described once, with a
//! getter and a setter over a JSON value. The registry is the single
//! traversal primitive behind the wire codec, JSON conversion and
//! in-place rewriting (e.g. src tagging on inbound).

use super::{Msg, MsgType, Payload, ResultPayload, StartGraphPayload, StatusCode, TimerPayload};
use serde_json::{Map, Value};

pub type FieldError = String;

pub struct FieldDef {
    pub name: &'static str,
    pub get: fn(&Msg) -> Value,
    pub put: fn(&mut Msg, &Value) -> Result<(), FieldError>,
}

fn to_json<T: serde::Serialize>(v: &T) -> Value {
    serde_json::to_value(v).unwrap_or(Value::Null)
}

fn from_json<T: serde::de::DeserializeOwned>(field: &str, v: &Value) -> Result<T, FieldError> {
    serde_json::from_value(v.clone()).map_err(|e| format!("field '{field}': {e}"))
}

fn get_type(m: &Msg) -> Value {
    to_json(&m.kind)
}

fn put_type(m: &mut Msg, v: &Value) -> Result<(), FieldError> {
    let kind: MsgType = from_json("type", v)?;
    if kind != m.kind {
        *m = Msg::empty_of(kind);
    }
    Ok(())
}

fn get_name(m: &Msg) -> Value {
    Value::String(m.name.clone())
}

fn put_name(m: &mut Msg, v: &Value) -> Result<(), FieldError> {
    m.name = from_json("name", v)?;
    Ok(())
}

fn get_src(m: &Msg) -> Value {
    to_json(&m.src)
}

fn put_src(m: &mut Msg, v: &Value) -> Result<(), FieldError> {
    m.src = from_json("src", v)?;
    Ok(())
}

fn get_dests(m: &Msg) -> Value {
    to_json(&m.dests)
}

fn put_dests(m: &mut Msg, v: &Value) -> Result<(), FieldError> {
    m.dests = from_json("dests", v)?;
    Ok(())
}

fn get_cmd_id(m: &Msg) -> Value {
    Value::String(m.cmd_id.clone())
}

fn put_cmd_id(m: &mut Msg, v: &Value) -> Result<(), FieldError> {
    m.cmd_id = from_json("cmd_id", v)?;
    Ok(())
}

fn get_parent_cmd_id(m: &Msg) -> Value {
    Value::String(m.parent_cmd_id.clone())
}

fn put_parent_cmd_id(m: &mut Msg, v: &Value) -> Result<(), FieldError> {
    m.parent_cmd_id = from_json("parent_cmd_id", v)?;
    Ok(())
}

fn start_graph_mut(m: &mut Msg) -> &mut StartGraphPayload {
    if !matches!(m.payload, Payload::StartGraph(_)) {
        m.payload = Payload::StartGraph(Box::default());
    }
    match &mut m.payload {
        Payload::StartGraph(p) => p,
        _ => unreachable!(),
    }
}

fn get_predefined_graph_name(m: &Msg) -> Value {
    match &m.payload {
        Payload::StartGraph(p) => Value::String(p.predefined_graph_name.clone()),
        _ => Value::Null,
    }
}

fn put_predefined_graph_name(m: &mut Msg, v: &Value) -> Result<(), FieldError> {
    start_graph_mut(m).predefined_graph_name = from_json("predefined_graph_name", v)?;
    Ok(())
}

fn get_long_running_mode(m: &Msg) -> Value {
    match &m.payload {
        Payload::StartGraph(p) => Value::Bool(p.long_running_mode),
        _ => Value::Null,
    }
}

fn put_long_running_mode(m: &mut Msg, v: &Value) -> Result<(), FieldError> {
    start_graph_mut(m).long_running_mode = from_json("long_running_mode", v)?;
    Ok(())
}

fn get_graph(m: &Msg) -> Value {
    match &m.payload {
        Payload::StartGraph(p) => to_json(&p.graph),
        _ => Value::Null,
    }
}

fn put_graph(m: &mut Msg, v: &Value) -> Result<(), FieldError> {
    start_graph_mut(m).graph = from_json("graph", v)?;
    Ok(())
}

fn get_stop_graph_id(m: &Msg) -> Value {
    match &m.payload {
        Payload::StopGraph { graph_id } => Value::String(graph_id.clone()),
        _ => Value::Null,
    }
}

fn put_stop_graph_id(m: &mut Msg, v: &Value) -> Result<(), FieldError> {
    let graph_id: String = from_json("graph_id", v)?;
    m.payload = Payload::StopGraph { graph_id };
    Ok(())
}

fn timer_mut(m: &mut Msg) -> &mut TimerPayload {
    if !matches!(m.payload, Payload::Timer(_)) {
        m.payload = Payload::Timer(TimerPayload::default());
    }
    match &mut m.payload {
        Payload::Timer(p) => p,
        _ => unreachable!(),
    }
}

fn get_timer_id(m: &Msg) -> Value {
    match &m.payload {
        Payload::Timer(p) => to_json(&p.timer_id),
        Payload::Timeout { timer_id } => to_json(timer_id),
        _ => Value::Null,
    }
}

fn put_timer_id(m: &mut Msg, v: &Value) -> Result<(), FieldError> {
    let id: u32 = from_json("timer_id", v)?;
    match &mut m.payload {
        Payload::Timeout { timer_id } => *timer_id = id,
        _ if m.kind == MsgType::CmdTimeout => m.payload = Payload::Timeout { timer_id: id },
        _ => timer_mut(m).timer_id = id,
    }
    Ok(())
}

fn get_timeout_us(m: &Msg) -> Value {
    match &m.payload {
        Payload::Timer(p) => to_json(&p.timeout_us),
        _ => Value::Null,
    }
}

fn put_timeout_us(m: &mut Msg, v: &Value) -> Result<(), FieldError> {
    timer_mut(m).timeout_us = from_json("timeout_us", v)?;
    Ok(())
}

fn get_times(m: &Msg) -> Value {
    match &m.payload {
        Payload::Timer(p) => to_json(&p.times),
        _ => Value::Null,
    }
}

fn put_times(m: &mut Msg, v: &Value) -> Result<(), FieldError> {
    timer_mut(m).times = from_json("times", v)?;
    Ok(())
}

fn result_mut(m: &mut Msg) -> &mut ResultPayload {
    if !matches!(m.payload, Payload::Result(_)) {
        m.payload = Payload::Result(ResultPayload {
            status: StatusCode::Ok,
            original_cmd_type: MsgType::Cmd,
        });
    }
    match &mut m.payload {
        Payload::Result(p) => p,
        _ => unreachable!(),
    }
}

fn get_status_code(m: &Msg) -> Value {
    match &m.payload {
        Payload::Result(p) => to_json(&p.status),
        _ => Value::Null,
    }
}

fn put_status_code(m: &mut Msg, v: &Value) -> Result<(), FieldError> {
    result_mut(m).status = from_json("status_code", v)?;
    Ok(())
}

fn get_original_cmd_type(m: &Msg) -> Value {
    match &m.payload {
        Payload::Result(p) => to_json(&p.original_cmd_type),
        _ => Value::Null,
    }
}

fn put_original_cmd_type(m: &mut Msg, v: &Value) -> Result<(), FieldError> {
    result_mut(m).original_cmd_type = from_json("original_cmd_type", v)?;
    Ok(())
}

const COMMON_FIELDS: &[FieldDef] = &[
    FieldDef {
        name: "type",
        get: get_type,
        put: put_type,
    },
    FieldDef {
        name: "name",
        get: get_name,
        put: put_name,
    },
    FieldDef {
        name: "src",
        get: get_src,
        put: put_src,
    },
    FieldDef {
        name: "dests",
        get: get_dests,
        put: put_dests,
    },
];

const CMD_FIELDS: &[FieldDef] = &[
    FieldDef {
        name: "cmd_id",
        get: get_cmd_id,
        put: put_cmd_id,
    },
    FieldDef {
        name: "parent_cmd_id",
        get: get_parent_cmd_id,
        put: put_parent_cmd_id,
    },
];

const START_GRAPH_FIELDS: &[FieldDef] = &[
    FieldDef {
        name: "predefined_graph_name",
        get: get_predefined_graph_name,
        put: put_predefined_graph_name,
    },
    FieldDef {
        name: "long_running_mode",
        get: get_long_running_mode,
        put: put_long_running_mode,
    },
    FieldDef {
        name: "graph",
        get: get_graph,
        put: put_graph,
    },
];

const STOP_GRAPH_FIELDS: &[FieldDef] = &[FieldDef {
    name: "graph_id",
    get: get_stop_graph_id,
    put: put_stop_graph_id,
}];

const TIMER_FIELDS: &[FieldDef] = &[
    FieldDef {
        name: "timer_id",
        get: get_timer_id,
        put: put_timer_id,
    },
    FieldDef {
        name: "timeout_us",
        get: get_timeout_us,
        put: put_timeout_us,
    },
    FieldDef {
        name: "times",
        get: get_times,
        put: put_times,
    },
];

const TIMEOUT_FIELDS: &[FieldDef] = &[FieldDef {
    name: "timer_id",
    get: get_timer_id,
    put: put_timer_id,
}];

const RESULT_FIELDS: &[FieldDef] = &[
    FieldDef {
        name: "status_code",
        get: get_status_code,
        put: put_status_code,
    },
    FieldDef {
        name: "original_cmd_type",
        get: get_original_cmd_type,
        put: put_original_cmd_type,
    },
];

/// Ordered field tables, common fields first, then cmd-family ids,
/// then the kind-specific tail.
pub fn field_tables(kind: MsgType) -> [&'static [FieldDef]; 3] {
    let cmd: &'static [FieldDef] = if kind.is_cmd_family() { CMD_FIELDS } else { &[] };
    let tail: &'static [FieldDef] = match kind {
        MsgType::CmdStartGraph => START_GRAPH_FIELDS,
        MsgType::CmdStopGraph => STOP_GRAPH_FIELDS,
        MsgType::CmdTimer => TIMER_FIELDS,
        MsgType::CmdTimeout => TIMEOUT_FIELDS,
        MsgType::CmdResult => RESULT_FIELDS,
        _ => &[],
    };
    [COMMON_FIELDS, cmd, tail]
}

/// Visit every runtime field, then every user property. The visitor
/// may rewrite the value in place and set `changed`; changed values
/// are written back through the field's setter. The first error aborts
/// the traversal.
pub fn process_fields<F>(msg: &mut Msg, visit: &mut F) -> Result<(), FieldError>
where
    F: FnMut(&str, &mut Value, bool, &mut bool) -> Result<(), FieldError>,
{
    for table in field_tables(msg.kind) {
        for def in table {
            let mut value = (def.get)(msg);
            let mut changed = false;
            visit(def.name, &mut value, false, &mut changed)?;
            if changed {
                (def.put)(msg, &value)?;
            }
        }
    }

    let keys: Vec<String> = msg.properties.keys().cloned().collect();
    for key in keys {
        let mut value = msg.properties.get(&key).cloned().unwrap_or(Value::Null);
        let mut changed = false;
        visit(&key, &mut value, true, &mut changed)?;
        if changed {
            msg.properties.insert(key, value);
        }
    }
    Ok(())
}

impl Msg {
    /// Envelope of `kind` with the matching default payload variant.
    pub fn empty_of(kind: MsgType) -> Msg {
        let mut msg = Msg::new(kind, "");
        msg.payload = match kind {
            MsgType::CmdStartGraph => Payload::StartGraph(Box::default()),
            MsgType::CmdStopGraph => Payload::StopGraph {
                graph_id: String::new(),
            },
            MsgType::CmdTimer => Payload::Timer(TimerPayload::default()),
            MsgType::CmdTimeout => Payload::Timeout { timer_id: 0 },
            MsgType::CmdResult => Payload::Result(ResultPayload {
                status: StatusCode::Ok,
                original_cmd_type: MsgType::Cmd,
            }),
            _ => Payload::Empty,
        };
        msg
    }

    /// Flatten into a JSON object via the field registry; user
    /// properties land under `properties`.
    pub fn to_value(&self) -> Value {
        let mut out = Map::new();
        for table in field_tables(self.kind) {
            for def in table {
                let value = (def.get)(self);
                if !value.is_null() {
                    out.insert(def.name.to_string(), value);
                }
            }
        }
        if !self.properties.is_empty() {
            out.insert(
                "properties".to_string(),
                Value::Object(self.properties.clone()),
            );
        }
        Value::Object(out)
    }

    /// Rebuild from the JSON object form. Unknown top-level keys are
    /// ignored.
    pub fn from_value(value: &Value) -> Result<Msg, FieldError> {
        let map = value
            .as_object()
            .ok_or_else(|| "message is not an object".to_string())?;
        let kind: MsgType = map
            .get("type")
            .ok_or_else(|| "message without 'type'".to_string())
            .and_then(|v| from_json("type", v))?;

        let mut msg = Msg::empty_of(kind);
        for table in field_tables(kind) {
            for def in table {
                if def.name == "type" {
                    continue;
                }
                if let Some(v) = map.get(def.name) {
                    (def.put)(&mut msg, v)?;
                }
            }
        }
        if let Some(Value::Object(props)) = map.get("properties") {
            msg.properties = props.clone();
        }
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphSpec;
    use crate::msg::Loc;

    #[test]
    fn value_round_trip_keeps_runtime_fields() {
        let mut cmd = Msg::start_graph(StartGraphPayload {
            predefined_graph_name: "default".into(),
            long_running_mode: true,
            graph: GraphSpec::default(),
        });
        cmd.ensure_cmd_id();
        cmd.dests = vec![Loc::app("mem://b:1/")];
        cmd.properties
            .insert("note".into(), Value::String("hello".into()));

        let back = Msg::from_value(&cmd.to_value()).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn visitor_can_rewrite_src() {
        let mut msg = Msg::data("frame");
        process_fields(&mut msg, &mut |name, value, user_defined, changed| {
            if name == "src" && !user_defined {
                *value = serde_json::to_value(Loc::app("mem://peer:1/")).unwrap();
                *changed = true;
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(msg.src.app_uri, "mem://peer:1/");
    }

    #[test]
    fn visitor_error_aborts() {
        let mut msg = Msg::data("frame");
        msg.properties.insert("bad".into(), Value::Null);
        let res = process_fields(&mut msg, &mut |name, _value, user_defined, _changed| {
            if user_defined && name == "bad" {
                Err("rejected".to_string())
            } else {
                Ok(())
            }
        });
        assert_eq!(res, Err("rejected".to_string()));
    }

    #[test]
    fn user_properties_are_flagged() {
        let mut msg = Msg::cmd("c");
        msg.properties.insert("k".into(), Value::Bool(true));
        let mut saw_user = false;
        process_fields(&mut msg, &mut |name, _v, user_defined, _c| {
            if user_defined {
                assert_eq!(name, "k");
                saw_user = true;
            }
            Ok(())
        })
        .unwrap();
        assert!(saw_user);
    }
}
