use crate::error::GraphError;
use ahash::AHashSet;
use serde::{Deserialize, Serialize};

/// Declarative graph description carried by a start_graph command.
///
/// Nodes name the extensions (and the groups hosting them) across one
/// or more apps; connections list per-extension destination fan-outs
/// keyed by message name.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSpec {
    #[serde(default)]
    pub nodes: Vec<GraphNode>,
    #[serde(default)]
    pub connections: Vec<GraphConnection>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Extension,
    ExtensionGroup,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub name: String,
    #[serde(default)]
    pub addon: String,
    #[serde(default)]
    pub app: String,
    #[serde(default)]
    pub extension_group: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphConnection {
    #[serde(default)]
    pub app: String,
    #[serde(default)]
    pub extension_group: String,
    pub extension: String,
    #[serde(default)]
    pub cmd: Vec<FlowDests>,
    #[serde(default)]
    pub data: Vec<FlowDests>,
}

/// Destinations of one named message flow.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowDests {
    pub name: String,
    #[serde(default)]
    pub dest: Vec<DestNode>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DestNode {
    #[serde(default)]
    pub app: String,
    #[serde(default)]
    pub extension_group: String,
    pub extension: String,
}

impl GraphSpec {
    /// Validate the spec and fill in the nodes it merely implies.
    ///
    /// Extension nodes referencing a group that has no explicit
    /// extension_group node get one auto-inserted. Two extension nodes
    /// with the same app/group/name but different addons are a
    /// construction error.
    pub fn normalize(&mut self) -> Result<(), GraphError> {
        let mut seen: AHashSet<(String, String, String)> = AHashSet::new();

        for node in &self.nodes {
            if node.node_type != NodeType::Extension {
                continue;
            }
            if node.name.is_empty() {
                return Err(GraphError::MalformedSpec(
                    "extension node with empty name".into(),
                ));
            }
            let key = (
                node.app.clone(),
                node.extension_group.clone(),
                node.name.clone(),
            );
            if !seen.insert(key) {
                return Err(GraphError::DuplicateNode(node.name.clone()));
            }
        }

        let groups: AHashSet<(String, String)> = self
            .nodes
            .iter()
            .filter(|n| n.node_type == NodeType::ExtensionGroup)
            .map(|n| (n.app.clone(), n.name.clone()))
            .collect();

        let mut implied: Vec<GraphNode> = Vec::new();
        let mut added: AHashSet<(String, String)> = AHashSet::new();
        for node in &self.nodes {
            if node.node_type != NodeType::Extension || node.extension_group.is_empty() {
                continue;
            }
            let key = (node.app.clone(), node.extension_group.clone());
            if groups.contains(&key) || added.contains(&key) {
                continue;
            }
            added.insert(key);
            implied.push(GraphNode {
                node_type: NodeType::ExtensionGroup,
                name: node.extension_group.clone(),
                addon: String::new(),
                app: node.app.clone(),
                extension_group: String::new(),
            });
        }
        self.nodes.extend(implied);

        Ok(())
    }

    /// App URIs this graph spans besides `self_uri`, in first-seen
    /// order. These are the peers an engine must open channels to.
    pub fn remote_uris(&self, self_uri: &str) -> Vec<String> {
        let mut seen: AHashSet<&str> = AHashSet::new();
        let mut out = Vec::new();

        let mut all: Vec<&str> = Vec::new();
        for node in &self.nodes {
            all.push(node.app.as_str());
        }
        for conn in &self.connections {
            all.push(conn.app.as_str());
            for flow in conn.cmd.iter().chain(conn.data.iter()) {
                for dest in &flow.dest {
                    all.push(dest.app.as_str());
                }
            }
        }

        for uri in all {
            if !uri.is_empty() && uri != self_uri && !seen.contains(uri) {
                seen.insert(uri);
                out.push(uri.to_string());
            }
        }
        out
    }

    /// Extension nodes that live on `self_uri`, grouped for the
    /// extension system.
    pub fn local_extensions<'a>(&'a self, self_uri: &str) -> Vec<&'a GraphNode> {
        self.nodes
            .iter()
            .filter(|n| {
                n.node_type == NodeType::Extension
                    && (n.app.is_empty() || n.app == self_uri)
            })
            .collect()
    }

    /// Names of the extension groups on `self_uri`.
    pub fn local_groups(&self, self_uri: &str) -> Vec<String> {
        let mut seen: AHashSet<String> = AHashSet::new();
        let mut out = Vec::new();
        for node in self.local_extensions(self_uri) {
            if node.extension_group.is_empty() {
                continue;
            }
            if seen.insert(node.extension_group.clone()) {
                out.push(node.extension_group.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ext(app: &str, group: &str, name: &str, addon: &str) -> GraphNode {
        GraphNode {
            node_type: NodeType::Extension,
            name: name.into(),
            addon: addon.into(),
            app: app.into(),
            extension_group: group.into(),
        }
    }

    #[test]
    fn normalize_inserts_implied_groups() {
        let mut spec = GraphSpec {
            nodes: vec![ext("mem://a:1/", "workers", "echo", "echo_addon")],
            connections: vec![],
        };
        spec.normalize().unwrap();

        let groups: Vec<_> = spec
            .nodes
            .iter()
            .filter(|n| n.node_type == NodeType::ExtensionGroup)
            .collect();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].name, "workers");
        assert_eq!(groups[0].app, "mem://a:1/");
    }

    #[test]
    fn normalize_rejects_duplicate_nodes() {
        let mut spec = GraphSpec {
            nodes: vec![
                ext("mem://a:1/", "g", "echo", "addon_one"),
                ext("mem://a:1/", "g", "echo", "addon_two"),
            ],
            connections: vec![],
        };
        assert!(matches!(
            spec.normalize(),
            Err(GraphError::DuplicateNode(_))
        ));
    }

    #[test]
    fn remote_uris_skips_self_and_dedupes() {
        let spec = GraphSpec {
            nodes: vec![
                ext("mem://a:1/", "g", "x", "a1"),
                ext("mem://b:1/", "g", "y", "a2"),
                ext("mem://b:1/", "g", "z", "a3"),
                ext("mem://c:1/", "g", "w", "a4"),
            ],
            connections: vec![],
        };
        assert_eq!(
            spec.remote_uris("mem://a:1/"),
            vec!["mem://b:1/".to_string(), "mem://c:1/".to_string()]
        );
    }
}
