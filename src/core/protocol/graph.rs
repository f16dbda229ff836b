//! Graph dumps: flattening a protocol to JSON and rebuilding it.
//!
//! ```text
//! {
//!   "title": str, "uri": str,
//!   "nodes": { name: { "uri", "type", "title", "data", "config" } },
//!   "links": [ { "from": {"node", "port"}, "to": {"node", "port"} } ],
//!   "interfaces": { name: { "to": {"node", "port"} } },
//!   "outerfaces": { name: { "from": {"node", "port"} } },
//!   "layout": { name: [x, y] }
//! }
//! ```

use super::{PROTOCOL_TYPE, Protocol, ProtocolLogic};
use crate::core::error::{EngineError, Result};
use crate::core::lock;
use crate::core::process::{Process, ProcessLogic};
use crate::lab::Lab;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::{Map, Value, json};
use std::sync::Arc;

/// Keys blanked or dropped by [`Protocol::barefy`].
const TIMESTAMP_KEYS: [&str; 3] = ["created_at", "last_modified_at", "save_datetime"];

impl ProtocolLogic {
    pub(crate) fn dumps(&self, protocol: &Process, bare: bool) -> Value {
        let graph = lock(&self.graph);
        let nodes: Map<String, Value> = graph
            .processes
            .iter()
            .map(|(name, process)| (name.clone(), process.to_json(bare)))
            .collect();
        let interfaces: Map<String, Value> = graph
            .interfaces
            .iter()
            .map(|(name, i)| (name.clone(), i.to_json()))
            .collect();
        let outerfaces: Map<String, Value> = graph
            .outerfaces
            .iter()
            .map(|(name, o)| (name.clone(), o.to_json()))
            .collect();
        let layout: Map<String, Value> = graph
            .layout
            .iter()
            .map(|(name, pos)| (name.clone(), json!(pos)))
            .collect();
        json!({
            "title": self.title(),
            "uri": if bare { "" } else { protocol.uri() },
            "nodes": nodes,
            "links": graph.connectors.iter().map(|c| c.to_json()).collect::<Vec<_>>(),
            "interfaces": interfaces,
            "outerfaces": outerfaces,
            "layout": layout,
        })
    }
}

fn str_at<'a>(value: &'a Value, pointer: &str, what: &str) -> Result<&'a str> {
    value
        .pointer(pointer)
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::Graph(format!("{} is missing '{}'", what, pointer)))
}

fn objects(graph: &Value, key: &str) -> Map<String, Value> {
    graph
        .get(key)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

impl Protocol {
    /// Flattens the protocol, recursively, to its graph JSON.
    ///
    /// A bare dump carries no URIs and serves as a template.
    pub fn dumps(&self, bare: bool) -> Value {
        self.logic().dumps(self.process(), bare)
    }

    /// Rebuilds a protocol from a graph dump.
    ///
    /// A bare rebuild creates new processes through the registry; otherwise
    /// persisted processes are reused by URI.
    pub fn from_graph(lab: &Arc<Lab>, graph: &Value, bare: bool) -> BoxFuture<'static, Result<Protocol>> {
        let lab = Arc::clone(lab);
        let graph = graph.clone();
        async move { Self::build_from_graph(lab, graph, bare).await }.boxed()
    }

    async fn build_from_graph(lab: Arc<Lab>, graph: Value, bare: bool) -> Result<Protocol> {
        let uri = graph.get("uri").and_then(Value::as_str).unwrap_or_default();
        let protocol = if bare || uri.is_empty() {
            Protocol::new(&lab).await?
        } else {
            Protocol::reuse(&lab, uri).await?
        };
        if let Some(title) = graph.get("title").and_then(Value::as_str) {
            protocol.set_title(title);
        }

        for (name, node) in objects(&graph, "nodes") {
            let what = format!("node '{}'", name);
            let type_name = str_at(&node, "/type", &what)?;
            let process = if type_name == PROTOCOL_TYPE {
                let sub = node
                    .pointer("/data/graph")
                    .ok_or_else(|| EngineError::Graph(format!("{} has no graph", what)))?;
                Protocol::from_graph(&lab, sub, bare).await?.into_process()
            } else {
                let node_uri = node.get("uri").and_then(Value::as_str).unwrap_or_default();
                if bare || node_uri.is_empty() {
                    lab.registry().get_or_create(&lab, type_name).await?
                } else {
                    Process::load(&lab, node_uri).await?
                }
            };
            if let Some(params) = node.pointer("/config/data/params").and_then(Value::as_object) {
                process.set_params(params)?;
            }
            protocol.add_process(&name, &process)?;
        }

        let links = graph
            .get("links")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for link in links {
            let source = protocol.get_process(str_at(&link, "/from/node", "link")?)?;
            let target = protocol.get_process(str_at(&link, "/to/node", "link")?)?;
            protocol.connect(
                &source,
                str_at(&link, "/from/port", "link")?,
                &target,
                str_at(&link, "/to/port", "link")?,
            )?;
        }

        for (name, interface) in objects(&graph, "interfaces") {
            let what = format!("interface '{}'", name);
            let target = protocol.get_process(str_at(&interface, "/to/node", &what)?)?;
            protocol.set_interface(&name, &target, str_at(&interface, "/to/port", &what)?)?;
        }
        for (name, outerface) in objects(&graph, "outerfaces") {
            let what = format!("outerface '{}'", name);
            let source = protocol.get_process(str_at(&outerface, "/from/node", &what)?)?;
            protocol.set_outerface(&name, &source, str_at(&outerface, "/from/port", &what)?)?;
        }

        for (name, position) in objects(&graph, "layout") {
            let coords: Vec<f64> = position
                .as_array()
                .map(|a| a.iter().filter_map(Value::as_f64).collect())
                .unwrap_or_default();
            if let [x, y] = coords[..] {
                protocol.set_position(&name, x, y)?;
            }
        }
        Ok(protocol)
    }

    /// Normalizes a dump for structural comparison: every URI is blanked,
    /// timestamps are dropped and links are sorted.
    pub fn barefy(graph: &Value) -> Value {
        match graph {
            Value::Object(map) => {
                let mut out = Map::new();
                for (key, value) in map {
                    if TIMESTAMP_KEYS.contains(&key.as_str()) {
                        continue;
                    }
                    let value = match (key.as_str(), value) {
                        ("uri", Value::String(_)) => Value::String(String::new()),
                        ("links", Value::Array(items)) => {
                            let mut items: Vec<Value> = items.iter().map(Protocol::barefy).collect();
                            items.sort_by_key(|v| v.to_string());
                            Value::Array(items)
                        }
                        _ => Protocol::barefy(value),
                    };
                    out.insert(key.clone(), value);
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(Protocol::barefy).collect()),
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_barefy_blanks_identity_and_sorts_links() {
        let dump = json!({
            "uri": "abc",
            "created_at": "2024-01-01",
            "links": [
                {"from": {"node": "b", "port": "x"}, "to": {"node": "c", "port": "y"}},
                {"from": {"node": "a", "port": "x"}, "to": {"node": "b", "port": "y"}},
            ],
            "nodes": {"a": {"uri": "u1", "config": {"uri": "c1", "data": {}}}},
        });
        let bare = Protocol::barefy(&dump);
        assert_eq!(bare["uri"], "");
        assert!(bare.get("created_at").is_none());
        assert_eq!(bare["nodes"]["a"]["uri"], "");
        assert_eq!(bare["nodes"]["a"]["config"]["uri"], "");
        assert_eq!(bare["links"][0]["from"]["node"], "a");
    }
}
