use crate::connection::ConnId;
use crate::msg::{Msg, StatusCode, DETAIL_DUPLICATE};
use ahash::AHashMap;
use tracing::debug;

/// How a group of out paths folds its members' results into one
/// verdict.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PathGroupPolicy {
    /// Any ERROR resolves the group immediately with that result.
    /// Success requires every member to report OK; the verdict is the
    /// last OK received.
    FirstErrorOrLastOk,
}

#[derive(Debug)]
struct OutPath {
    dest_uri: String,
    result: Option<Msg>,
}

/// Pending fan-out of one command to several peers.
#[derive(Debug)]
pub struct PathGroup {
    pub original_cmd: Msg,
    pub src_conn: Option<ConnId>,
    pub policy: PathGroupPolicy,
    members: Vec<OutPath>,
}

/// Outcome of feeding a result into the table.
#[derive(Debug)]
pub enum PathResolution {
    /// No path waits for this cmd id; the result is handed back for
    /// the caller to discard.
    Unmatched(Msg),
    /// The group still waits on other members.
    Pending,
    /// The group is complete (or short-circuited); `verdict` is the
    /// result to answer the original command with.
    Resolved {
        group: PathGroup,
        verdict: Box<Msg>,
    },
}

/// Correlates cmd ids with the commands awaiting their results.
///
/// Out groups track fan-outs this engine made; in paths remember
/// incoming commands that still need an answer over their source
/// connection.
#[derive(Default)]
pub struct PathTable {
    out_groups: AHashMap<String, PathGroup>,
    in_paths: AHashMap<String, InPath>,
}

#[derive(Debug)]
pub struct InPath {
    pub original_cmd: Msg,
    pub src_conn: Option<ConnId>,
}

impl PathTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_out_group(
        &mut self,
        original_cmd: Msg,
        src_conn: Option<ConnId>,
        dest_uris: Vec<String>,
        policy: PathGroupPolicy,
    ) {
        debug_assert!(!dest_uris.is_empty());
        let cmd_id = original_cmd.cmd_id.clone();
        let members = dest_uris
            .into_iter()
            .map(|dest_uri| OutPath {
                dest_uri,
                result: None,
            })
            .collect();
        self.out_groups.insert(
            cmd_id,
            PathGroup {
                original_cmd,
                src_conn,
                policy,
                members,
            },
        );
    }

    pub fn has_out_group(&self, cmd_id: &str) -> bool {
        self.out_groups.contains_key(cmd_id)
    }

    /// Feed a result arriving from `from_uri`. A result whose detail is
    /// the reserved duplicate marker counts as OK: the peer tore down a
    /// redundant channel, not the graph.
    pub fn on_result(&mut self, from_uri: &str, mut result: Msg) -> PathResolution {
        let group = match self.out_groups.get_mut(&result.cmd_id) {
            Some(g) => g,
            None => {
                debug!(
                    "[PathTable] discarding unmatched result, cmd_id: {}, from: {}",
                    result.cmd_id, from_uri
                );
                return PathResolution::Unmatched(result);
            }
        };

        let benign_duplicate = result.detail() == Some(DETAIL_DUPLICATE);
        let failed = result.status() == Some(StatusCode::Error) && !benign_duplicate;

        let member = group
            .members
            .iter()
            .position(|m| m.dest_uri == from_uri && m.result.is_none())
            .or_else(|| {
                // Result relayed without a known member uri: fill the
                // first open slot.
                if from_uri.is_empty() {
                    group.members.iter().position(|m| m.result.is_none())
                } else {
                    None
                }
            });
        match member {
            Some(i) => group.members[i].result = Some(result.clone()),
            None => {
                debug!(
                    "[PathTable] result from {} matches no open path, cmd_id: {}",
                    from_uri, result.cmd_id
                );
                return PathResolution::Unmatched(result);
            }
        }

        match group.policy {
            PathGroupPolicy::FirstErrorOrLastOk => {
                if failed {
                    return match self.out_groups.remove(&result.cmd_id) {
                        Some(group) => PathResolution::Resolved {
                            group,
                            verdict: Box::new(result),
                        },
                        None => PathResolution::Unmatched(result),
                    };
                }
                if group.members.iter().all(|m| m.result.is_some()) {
                    if benign_duplicate {
                        // The group succeeded; the last peer merely tore
                        // down a redundant channel. The verdict must not
                        // read as a failure.
                        result.set_status(StatusCode::Ok);
                        result.set_detail("");
                    }
                    return match self.out_groups.remove(&result.cmd_id) {
                        Some(group) => PathResolution::Resolved {
                            group,
                            verdict: Box::new(result),
                        },
                        None => PathResolution::Unmatched(result),
                    };
                }
                PathResolution::Pending
            }
        }
    }

    pub fn create_in_path(&mut self, original_cmd: Msg, src_conn: Option<ConnId>) {
        self.in_paths.insert(
            original_cmd.cmd_id.clone(),
            InPath {
                original_cmd,
                src_conn,
            },
        );
    }

    pub fn take_in_path(&mut self, cmd_id: &str) -> Option<InPath> {
        self.in_paths.remove(cmd_id)
    }

    pub fn is_empty(&self) -> bool {
        self.out_groups.is_empty() && self.in_paths.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{Loc, MsgType};

    fn fanned_cmd() -> Msg {
        let mut cmd = Msg::new(MsgType::CmdStartGraph, "start_graph");
        cmd.cmd_id = "cmd-1".into();
        cmd.src = Loc::app("cmd-1");
        cmd
    }

    fn ok_result(cmd_id: &str) -> Msg {
        let mut orig = Msg::cmd("x");
        orig.cmd_id = cmd_id.to_string();
        Msg::result_from(StatusCode::Ok, &orig).with_detail("")
    }

    fn err_result(cmd_id: &str, detail: &str) -> Msg {
        let mut orig = Msg::cmd("x");
        orig.cmd_id = cmd_id.to_string();
        Msg::result_from(StatusCode::Error, &orig).with_detail(detail)
    }

    #[test]
    fn all_ok_resolves_with_last() {
        let mut table = PathTable::new();
        table.create_out_group(
            fanned_cmd(),
            None,
            vec!["mem://b:1/".into(), "mem://c:1/".into()],
            PathGroupPolicy::FirstErrorOrLastOk,
        );

        assert!(matches!(
            table.on_result("mem://b:1/", ok_result("cmd-1")),
            PathResolution::Pending
        ));
        match table.on_result("mem://c:1/", ok_result("cmd-1")) {
            PathResolution::Resolved { verdict, .. } => {
                assert_eq!(verdict.status(), Some(StatusCode::Ok));
            }
            other => panic!("expected resolution, got {other:?}"),
        }
        assert!(table.is_empty());
    }

    #[test]
    fn first_error_short_circuits() {
        let mut table = PathTable::new();
        table.create_out_group(
            fanned_cmd(),
            None,
            vec!["mem://b:1/".into(), "mem://c:1/".into()],
            PathGroupPolicy::FirstErrorOrLastOk,
        );

        match table.on_result("mem://b:1/", err_result("cmd-1", "connect failed")) {
            PathResolution::Resolved { verdict, .. } => {
                assert_eq!(verdict.status(), Some(StatusCode::Error));
                assert_eq!(verdict.detail(), Some("connect failed"));
            }
            other => panic!("expected resolution, got {other:?}"),
        }
        // The late OK from the other member is now unmatched.
        assert!(matches!(
            table.on_result("mem://c:1/", ok_result("cmd-1")),
            PathResolution::Unmatched(_)
        ));
    }

    #[test]
    fn duplicate_detail_is_benign() {
        let mut table = PathTable::new();
        table.create_out_group(
            fanned_cmd(),
            None,
            vec!["mem://b:1/".into()],
            PathGroupPolicy::FirstErrorOrLastOk,
        );

        match table.on_result("mem://b:1/", err_result("cmd-1", DETAIL_DUPLICATE)) {
            PathResolution::Resolved { verdict, .. } => {
                // Resolves the group without propagating the error.
                assert_eq!(verdict.status(), Some(StatusCode::Ok));
                assert_eq!(verdict.detail(), Some(""));
            }
            other => panic!("expected resolution, got {other:?}"),
        }
    }

    #[test]
    fn duplicate_member_does_not_fail_the_group() {
        let mut table = PathTable::new();
        table.create_out_group(
            fanned_cmd(),
            None,
            vec!["mem://b:1/".into(), "mem://c:1/".into()],
            PathGroupPolicy::FirstErrorOrLastOk,
        );

        assert!(matches!(
            table.on_result("mem://b:1/", ok_result("cmd-1")),
            PathResolution::Pending
        ));
        // The second member tore down a redundant channel; the group
        // still resolves OK.
        match table.on_result("mem://c:1/", err_result("cmd-1", DETAIL_DUPLICATE)) {
            PathResolution::Resolved { verdict, .. } => {
                assert_eq!(verdict.status(), Some(StatusCode::Ok));
                assert_eq!(verdict.detail(), Some(""));
            }
            other => panic!("expected resolution, got {other:?}"),
        }
        assert!(table.is_empty());
    }

    #[test]
    fn unmatched_result_is_returned() {
        let mut table = PathTable::new();
        assert!(matches!(
            table.on_result("mem://b:1/", ok_result("ghost")),
            PathResolution::Unmatched(_)
        ));
    }
}
