use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{flex, NodeOp, PostStep};

pub type NodeId = i64;

/* --------- Documento ETL tal como se guarda en el proyecto --------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtlDoc {
    #[serde(deserialize_with = "flex::id_string")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub content: EtlContent,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EtlContent {
    #[serde(default)]
    pub nodes: Vec<NodeDoc>,
    #[serde(default)]
    pub edges: Vec<EdgeDoc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDoc {
    #[serde(deserialize_with = "flex::node_id")]
    pub id: NodeId,

    /// "source", "transform" o "destination".
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,

    #[serde(default)]
    pub config: Map<String, Value>,

    /// Posición en el lienzo; el motor no la usa.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeDoc {
    #[serde(deserialize_with = "flex::node_id")]
    pub source: NodeId,
    #[serde(deserialize_with = "flex::node_id")]
    pub target: NodeId,
}

/* --------- DAG compilado --------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Source,
    Transform,
    Destination,
}

impl NodeKind {
    pub fn parse(s: &str) -> Option<NodeKind> {
        match s.trim().to_ascii_lowercase().as_str() {
            "source" => Some(NodeKind::Source),
            "transform" => Some(NodeKind::Transform),
            "destination" => Some(NodeKind::Destination),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Source => "source",
            NodeKind::Transform => "transform",
            NodeKind::Destination => "destination",
        }
    }

    pub fn output_arity(self) -> usize {
        match self {
            NodeKind::Destination => 0,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DagNode {
    pub id: NodeId,
    pub kind: NodeKind,
    /// Subtipo normalizado (trim + minúsculas).
    pub subtype: String,
    pub op: NodeOp,
    pub post: PostStep,
}

impl DagNode {
    pub fn input_arity(&self) -> usize {
        self.op.input_arity()
    }

    pub fn label(&self) -> String {
        format!("{} {}/{}", self.id, self.kind.as_str(), self.subtype)
    }
}

/// Grafo validado: sin ciclos, extremos existentes y aridades respetadas.
#[derive(Debug, Clone)]
pub struct Dag {
    nodes: Vec<DagNode>,
    index: HashMap<NodeId, usize>,
    /// (origen, destino) en orden de llegada.
    edges: Vec<(NodeId, NodeId)>,
}

impl Dag {
    /// Sólo la usa el compilador, que ya validó el grafo.
    pub(crate) fn from_parts(nodes: Vec<DagNode>, edges: Vec<(NodeId, NodeId)>) -> Self {
        let index = nodes.iter().enumerate().map(|(i, n)| (n.id, i)).collect();
        Self { nodes, index, edges }
    }

    pub fn nodes(&self) -> &[DagNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[(NodeId, NodeId)] {
        &self.edges
    }

    pub fn node(&self, id: NodeId) -> Option<&DagNode> {
        self.index.get(&id).map(|&i| &self.nodes[i])
    }

    /// Predecesores en orden de llegada de las aristas.
    pub fn predecessors(&self, id: NodeId) -> Vec<NodeId> {
        self.edges
            .iter()
            .filter(|(_, t)| *t == id)
            .map(|(s, _)| *s)
            .collect()
    }

    pub fn successors(&self, id: NodeId) -> Vec<NodeId> {
        self.edges
            .iter()
            .filter(|(s, _)| *s == id)
            .map(|(_, t)| *t)
            .collect()
    }

    pub fn sources(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.kind == NodeKind::Source)
            .map(|n| n.id)
            .collect()
    }

    pub fn sinks(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.kind == NodeKind::Destination)
            .map(|n| n.id)
            .collect()
    }

    /// Orden topológico (Kahn). Entre nodos listos gana el declarado antes,
    /// así el orden es determinista.
    pub fn topo_order(&self) -> Vec<NodeId> {
        topo_sort(
            &self.nodes.iter().map(|n| n.id).collect::<Vec<_>>(),
            &self.edges,
        )
        .unwrap_or_default()
    }
}

/// Devuelve `None` si hay un ciclo.
pub(crate) fn topo_sort(ids: &[NodeId], edges: &[(NodeId, NodeId)]) -> Option<Vec<NodeId>> {
    let position: HashMap<NodeId, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();
    let mut indegree = vec![0usize; ids.len()];
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); ids.len()];
    for (s, t) in edges {
        let (Some(&si), Some(&ti)) = (position.get(s), position.get(t)) else {
            continue;
        };
        adjacency[si].push(ti);
        indegree[ti] += 1;
    }

    let mut ready: VecDeque<usize> = (0..ids.len()).filter(|&i| indegree[i] == 0).collect();
    let mut order = Vec::with_capacity(ids.len());
    while let Some(i) = ready.pop_front() {
        order.push(ids[i]);
        let mut newly_ready = Vec::new();
        for &j in &adjacency[i] {
            indegree[j] -= 1;
            if indegree[j] == 0 {
                newly_ready.push(j);
            }
        }
        newly_ready.sort_unstable();
        for j in newly_ready {
            // mantener la cola ordenada por posición de declaración
            let at = ready.iter().position(|&r| r > j).unwrap_or(ready.len());
            ready.insert(at, j);
        }
    }

    (order.len() == ids.len()).then_some(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn topo_sort_respeta_orden_de_declaracion() {
        let order = topo_sort(&[1, 2, 3, 4], &[(1, 3), (2, 3), (3, 4)]).unwrap();
        assert_eq!(order, vec![1, 2, 3, 4]);

        let order = topo_sort(&[4, 3, 2, 1], &[(1, 3), (2, 3), (3, 4)]).unwrap();
        assert_eq!(order, vec![2, 1, 3, 4]);
    }

    #[test]
    fn topo_sort_detecta_ciclos() {
        assert!(topo_sort(&[1, 2, 3], &[(1, 2), (2, 3), (3, 2)]).is_none());
    }

    #[test]
    fn node_doc_acepta_ids_como_texto() {
        let n: NodeDoc = serde_json::from_value(json!({
            "id": "12", "type": "source", "subtype": "csv", "config": {"path": "a.csv"}
        }))
        .unwrap();
        assert_eq!(n.id, 12);
        assert_eq!(n.kind, "source");

        let e: EdgeDoc = serde_json::from_value(json!({"source": 1, "target": "2"})).unwrap();
        assert_eq!((e.source, e.target), (1, 2));
    }
}
