use crate::action::Action;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

// Graphs are not straightforward in Rust due to ownership, so vertices are
// referenced by their index in an arena. The graph is immutable once
// validated, so indices stay stable for the whole run.

pub type VertexId = usize;

#[derive(Debug)]
struct Vertex {
    name: String,
    action: Action,
    out: Vec<VertexId>,
    in_degree: usize,
}

/// A validated, immutable action graph with a unique start vertex.
#[derive(Debug)]
pub struct ActionGraph {
    vertices: Vec<Vertex>,
    start: VertexId,
}

impl ActionGraph {
    pub fn from_file(path: impl AsRef<Path>) -> Result<ActionGraph> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Graph(format!("cannot read '{}': {e}", path.display())))?;
        Self::from_str(&text)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(text: &str) -> Result<ActionGraph> {
        let raw: GraphYaml =
            serde_yaml::from_str(text).map_err(|e| Error::Graph(e.to_string()))?;

        let mut builder = GraphBuilder::new();
        let mut ids: HashMap<String, VertexId> = HashMap::new();
        for vertex in &raw.vertices {
            let action = vertex.to_action()?;
            let id = builder.add_named_vertex(&vertex.id, action);
            if ids.insert(vertex.id.clone(), id).is_some() {
                return Err(Error::Graph(format!("duplicate vertex id '{}'", vertex.id)));
            }
        }
        for (from, to) in &raw.edges {
            let from = *ids
                .get(from)
                .ok_or_else(|| Error::Graph(format!("edge references unknown vertex '{from}'")))?;
            let to = *ids
                .get(to)
                .ok_or_else(|| Error::Graph(format!("edge references unknown vertex '{to}'")))?;
            builder.add_edge(from, to)?;
        }
        builder.build()
    }

    pub fn start_vertex(&self) -> VertexId {
        self.start
    }

    /// Outgoing edges in load order; the driver walks them in this order.
    pub fn successors(&self, v: VertexId) -> &[VertexId] {
        &self.vertices[v].out
    }

    pub fn action_of(&self, v: VertexId) -> &Action {
        &self.vertices[v].action
    }

    pub fn in_degree(&self, v: VertexId) -> usize {
        self.vertices[v].in_degree
    }

    pub fn name_of(&self, v: VertexId) -> &str {
        &self.vertices[v].name
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }
}

/// Programmatic construction, used by the loader, embedders, and tests.
#[derive(Debug, Default)]
pub struct GraphBuilder {
    vertices: Vec<Vertex>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        GraphBuilder::default()
    }

    /// Add a vertex named after its action kind.
    pub fn add_vertex(&mut self, action: Action) -> VertexId {
        let name = format!("{}{}", action.kind_name(), self.vertices.len());
        self.add_named_vertex(&name, action)
    }

    pub fn add_named_vertex(&mut self, name: &str, action: Action) -> VertexId {
        self.vertices.push(Vertex {
            name: name.to_string(),
            action,
            out: Vec::new(),
            in_degree: 0,
        });
        self.vertices.len() - 1
    }

    pub fn add_edge(&mut self, from: VertexId, to: VertexId) -> Result<()> {
        if from >= self.vertices.len() || to >= self.vertices.len() {
            return Err(Error::Graph(format!("edge ({from}, {to}) is out of bounds")));
        }
        self.vertices[from].out.push(to);
        self.vertices[to].in_degree += 1;
        Ok(())
    }

    /// Validate and freeze the graph: exactly one start vertex, and no edges
    /// into it.
    pub fn build(self) -> Result<ActionGraph> {
        let mut starts = self
            .vertices
            .iter()
            .enumerate()
            .filter(|(_, v)| matches!(v.action, Action::Start { .. }));
        let start = match (starts.next(), starts.next()) {
            (Some((id, _)), None) => id,
            (None, _) => return Err(Error::Graph("graph has no start vertex".into())),
            (Some(_), Some((id, _))) => {
                return Err(Error::Graph(format!(
                    "graph has more than one start vertex ('{}')",
                    self.vertices[id].name
                )))
            }
        };
        if self.vertices[start].in_degree > 0 {
            return Err(Error::Graph(format!(
                "start vertex '{}' must not have incoming edges",
                self.vertices[start].name
            )));
        }
        Ok(ActionGraph {
            vertices: self.vertices,
            start,
        })
    }
}

// On-disk graph document. Attribute values keep the original string forms
// (peer lists, byte sizes with suffixes) and are decoded by the action
// constructors; the YAML layer only provides structure.

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct GraphYaml {
    vertices: Vec<VertexYaml>,
    #[serde(default)]
    edges: Vec<(String, String)>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
struct VertexYaml {
    id: String,
    action: String,
    time: Option<u64>,
    serverport: Option<u16>,
    peers: Option<String>,
    socksproxy: Option<String>,
    count: Option<u64>,
    size: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    protocol: Option<String>,
}

fn require<T>(field: Option<T>, action: &str, name: &str) -> Result<T> {
    field.ok_or_else(|| {
        Error::Graph(format!(
            "{action} action missing required attribute '{name}'"
        ))
    })
}

impl VertexYaml {
    fn to_action(&self) -> Result<Action> {
        match self.action.to_ascii_lowercase().as_str() {
            "start" => Action::new_start(
                require(self.time, "start", "time")?,
                require(self.serverport, "start", "serverport")?,
                require(self.peers.as_deref(), "start", "peers")?,
                self.socksproxy.as_deref(),
            ),
            "end" => Action::new_end(self.time, self.count, self.size.as_deref()),
            "pause" => Ok(Action::new_pause(require(self.time, "pause", "time")?)),
            "synchronize" => Ok(Action::Synchronize),
            "transfer" => Action::new_transfer(
                require(self.kind.as_deref(), "transfer", "type")?,
                require(self.protocol.as_deref(), "transfer", "protocol")?,
                require(self.size.as_deref(), "transfer", "size")?,
                self.peers.as_deref(),
            ),
            other => Err(Error::Graph(format!("unknown action '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
vertices:
  - id: start
    action: start
    time: 0
    serverport: 9000
    peers: 127.0.0.1:9001,127.0.0.1:9002
  - id: wait
    action: pause
    time: 2
  - id: fetch
    action: transfer
    type: get
    protocol: tcp
    size: 1 MiB
  - id: done
    action: end
    count: 1
edges:
  - [start, wait]
  - [wait, fetch]
  - [fetch, done]
"#;

    #[test]
    fn load_sample() {
        let graph = ActionGraph::from_str(SAMPLE).unwrap();
        assert_eq!(graph.len(), 4);
        let start = graph.start_vertex();
        assert_eq!(graph.name_of(start), "start");
        assert_eq!(graph.in_degree(start), 0);

        let wait = graph.successors(start)[0];
        assert!(matches!(graph.action_of(wait), Action::Pause { time_s: 2 }));
        let fetch = graph.successors(wait)[0];
        match graph.action_of(fetch) {
            Action::Transfer { size_bytes, peers, .. } => {
                assert_eq!(*size_bytes, 1 << 20);
                assert!(peers.is_none());
            }
            other => panic!("expected a transfer, got {other:?}"),
        }
        let done = graph.successors(fetch)[0];
        assert!(matches!(
            graph.action_of(done),
            Action::End { count: 1, time_s: 0, size_bytes: 0 }
        ));
        assert!(graph.successors(done).is_empty());
    }

    #[test]
    fn successor_order_is_load_order() {
        let yaml = r#"
vertices:
  - id: start
    action: start
    time: 0
    serverport: 9000
    peers: 127.0.0.1:9001
  - id: b
    action: pause
    time: 1
  - id: a
    action: pause
    time: 1
  - id: c
    action: pause
    time: 1
edges:
  - [start, b]
  - [start, a]
  - [start, c]
"#;
        let graph = ActionGraph::from_str(yaml).unwrap();
        let names: Vec<&str> = graph
            .successors(graph.start_vertex())
            .iter()
            .map(|&v| graph.name_of(v))
            .collect();
        assert_eq!(names, ["b", "a", "c"]);
    }

    #[test]
    fn rejects_two_starts() {
        let yaml = r#"
vertices:
  - id: s1
    action: start
    time: 0
    serverport: 9000
    peers: 127.0.0.1:9001
  - id: s2
    action: start
    time: 0
    serverport: 9001
    peers: 127.0.0.1:9001
"#;
        assert!(ActionGraph::from_str(yaml).is_err());
    }

    #[test]
    fn rejects_edge_into_start() {
        let yaml = r#"
vertices:
  - id: start
    action: start
    time: 0
    serverport: 9000
    peers: 127.0.0.1:9001
  - id: wait
    action: pause
    time: 1
edges:
  - [start, wait]
  - [wait, start]
"#;
        assert!(ActionGraph::from_str(yaml).is_err());
    }

    #[test]
    fn rejects_unknown_edge_endpoint() {
        let yaml = r#"
vertices:
  - id: start
    action: start
    time: 0
    serverport: 9000
    peers: 127.0.0.1:9001
edges:
  - [start, nowhere]
"#;
        assert!(ActionGraph::from_str(yaml).is_err());
    }

    #[test]
    fn rejects_missing_attributes_and_reserved_protocols() {
        let missing_time = r#"
vertices:
  - id: start
    action: start
    serverport: 9000
    peers: 127.0.0.1:9001
"#;
        assert!(ActionGraph::from_str(missing_time).is_err());

        let udp = r#"
vertices:
  - id: start
    action: start
    time: 0
    serverport: 9000
    peers: 127.0.0.1:9001
  - id: t
    action: transfer
    type: get
    protocol: udp
    size: 1 kb
"#;
        assert!(ActionGraph::from_str(udp).is_err());
    }

    #[test]
    fn synchronize_in_degree_counts_predecessors() {
        let yaml = r#"
vertices:
  - id: start
    action: start
    time: 0
    serverport: 9000
    peers: 127.0.0.1:9001
  - id: p1
    action: pause
    time: 1
  - id: p2
    action: pause
    time: 3
  - id: join
    action: synchronize
edges:
  - [start, p1]
  - [start, p2]
  - [p1, join]
  - [p2, join]
"#;
        let graph = ActionGraph::from_str(yaml).unwrap();
        let join = (0..graph.len())
            .find(|&v| matches!(graph.action_of(v), Action::Synchronize))
            .unwrap();
        assert_eq!(graph.in_degree(join), 2);
    }
}
