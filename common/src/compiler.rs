//! Compilador: documento ETL + overrides -> `Dag` validado.

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::{NodeOp, PostStep};
use crate::dag::{topo_sort, Dag, DagNode, EtlDoc, NodeId, NodeKind};
use crate::error::{CompileErrorKind, EtlError, Result};

/// Resultado de compilar: el grafo y las claves de override descartadas.
#[derive(Debug, Clone)]
pub struct CompiledEtl {
    pub dag: Dag,
    pub ignored_overrides: Vec<String>,
}

/// Parte una clave `"<node_id>.<config_key>"`.
fn split_override_key(key: &str) -> Option<(NodeId, &str)> {
    let (node, field) = key.split_once('.')?;
    let node = node.trim().parse::<NodeId>().ok()?;
    let field = field.trim();
    (!field.is_empty()).then_some((node, field))
}

/// Aplica las overrides sobre los mapas crudos de configuración.
/// Devuelve las claves mal formadas, que no se aplican.
pub fn apply_overrides(configs: &mut HashMap<NodeId, Map<String, Value>>, overrides: &Map<String, Value>) -> Vec<String> {
    let mut ignored = Vec::new();
    for (key, value) in overrides {
        let Some((node, field)) = split_override_key(key) else {
            warn!("override '{key}' ignorada: se esperaba <nodo>.<clave>");
            ignored.push(key.clone());
            continue;
        };
        match configs.get_mut(&node) {
            Some(cfg) => {
                cfg.insert(field.to_string(), value.clone());
            }
            None => debug!("override '{key}' ignorada: no existe el nodo {node}"),
        }
    }
    ignored
}

pub fn compile(etl: &EtlDoc, overrides: &Map<String, Value>) -> Result<CompiledEtl> {
    let content = &etl.content;

    let mut seen = HashSet::new();
    for n in &content.nodes {
        if !seen.insert(n.id) {
            return Err(EtlError::compile(
                CompileErrorKind::DuplicateNode,
                Some(n.id),
                format!("el nodo {} está duplicado", n.id),
            ));
        }
    }

    let mut configs: HashMap<NodeId, Map<String, Value>> =
        content.nodes.iter().map(|n| (n.id, n.config.clone())).collect();
    let ignored_overrides = apply_overrides(&mut configs, overrides);

    let mut nodes = Vec::with_capacity(content.nodes.len());
    for doc in &content.nodes {
        let kind = NodeKind::parse(&doc.kind).ok_or_else(|| {
            EtlError::compile(
                CompileErrorKind::UnknownKind,
                Some(doc.id),
                format!("nodo {}: tipo '{}' desconocido", doc.id, doc.kind),
            )
        })?;
        let subtype = doc
            .subtype
            .as_deref()
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                EtlError::compile(
                    CompileErrorKind::UnknownSubtype,
                    Some(doc.id),
                    format!("nodo {}: falta el subtipo", doc.id),
                )
            })?;
        let config = configs.remove(&doc.id).unwrap_or_default();
        let op = NodeOp::parse(doc.id, kind, &subtype, &config)?;
        let post = PostStep::from_config(&config)?;
        nodes.push(DagNode { id: doc.id, kind, subtype, op, post });
    }

    let by_id: HashMap<NodeId, &DagNode> = nodes.iter().map(|n| (n.id, n)).collect();
    let mut edges = Vec::with_capacity(content.edges.len());
    let mut in_degree: HashMap<NodeId, usize> = HashMap::new();
    for e in &content.edges {
        for end in [e.source, e.target] {
            if !by_id.contains_key(&end) {
                return Err(EtlError::compile(
                    CompileErrorKind::UnknownNode,
                    Some(end),
                    format!("arista {} -> {}: el nodo {end} no existe", e.source, e.target),
                ));
            }
        }
        if let Some(src) = by_id.get(&e.source) {
            if src.kind.output_arity() == 0 {
                return Err(EtlError::compile(
                    CompileErrorKind::ArityViolation,
                    Some(e.source),
                    format!("el nodo {} es un destino y no puede tener salidas", e.source),
                ));
            }
        }
        *in_degree.entry(e.target).or_default() += 1;
        edges.push((e.source, e.target));
    }

    for n in &nodes {
        let got = in_degree.get(&n.id).copied().unwrap_or(0);
        if got > n.input_arity() {
            return Err(EtlError::compile(
                CompileErrorKind::ArityViolation,
                Some(n.id),
                format!("nodo {} acepta {} entradas y recibe {got}", n.label(), n.input_arity()),
            ));
        }
    }

    let ids: Vec<NodeId> = nodes.iter().map(|n| n.id).collect();
    if topo_sort(&ids, &edges).is_none() {
        return Err(EtlError::compile(CompileErrorKind::Cycle, None, "el grafo tiene un ciclo"));
    }

    Ok(CompiledEtl { dag: Dag::from_parts(nodes, edges), ignored_overrides })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SourceConfig, NodeOp};
    use serde_json::json;

    fn etl(content: Value) -> EtlDoc {
        serde_json::from_value(json!({"id": "e1", "name": "prueba", "content": content})).unwrap()
    }

    fn kind_of(err: EtlError) -> CompileErrorKind {
        match err {
            EtlError::Compile { kind, .. } => kind,
            other => panic!("se esperaba CompileError, llegó {other:?}"),
        }
    }

    fn lineal() -> EtlDoc {
        etl(json!({
            "nodes": [
                {"id": 1, "type": "source", "subtype": " CSV ", "config": {"path": "a.csv"}},
                {"id": 2, "type": "transform", "subtype": "filter", "config": {"filter_rules": []}},
                {"id": 3, "type": "destination", "subtype": "json", "config": {"path": "out.json"}}
            ],
            "edges": [{"source": 1, "target": 2}, {"source": 2, "target": 3}]
        }))
    }

    #[test]
    fn compila_y_normaliza_subtipos() {
        let c = compile(&lineal(), &Map::new()).unwrap();
        assert_eq!(c.dag.topo_order(), vec![1, 2, 3]);
        assert_eq!(c.dag.node(1).unwrap().subtype, "csv");
        assert!(c.ignored_overrides.is_empty());
    }

    #[test]
    fn overrides_se_aplican_antes_del_parseo() {
        let mut ov = Map::new();
        ov.insert("1.path".into(), json!("b.csv"));
        ov.insert("9.path".into(), json!("nadie.csv"));
        ov.insert("sin_punto".into(), json!(1));
        ov.insert("x.path".into(), json!(1));
        let c = compile(&lineal(), &ov).unwrap();
        match &c.dag.node(1).unwrap().op {
            NodeOp::Source(SourceConfig::File(f)) => assert_eq!(f.path.as_deref(), Some("b.csv")),
            other => panic!("{other:?}"),
        }
        assert_eq!(c.ignored_overrides, vec!["sin_punto".to_string(), "x.path".to_string()]);
    }

    #[test]
    fn detecta_ciclos() {
        let doc = etl(json!({
            "nodes": [
                {"id": 1, "type": "transform", "subtype": "select"},
                {"id": 2, "type": "transform", "subtype": "select"}
            ],
            "edges": [{"source": 1, "target": 2}, {"source": 2, "target": 1}]
        }));
        assert_eq!(kind_of(compile(&doc, &Map::new()).unwrap_err()), CompileErrorKind::Cycle);
    }

    #[test]
    fn detecta_nodos_inexistentes_y_aridad() {
        let mut doc = lineal();
        doc.content.edges.push(crate::dag::EdgeDoc { source: 1, target: 7 });
        assert_eq!(kind_of(compile(&doc, &Map::new()).unwrap_err()), CompileErrorKind::UnknownNode);

        let mut doc = lineal();
        doc.content.edges.push(crate::dag::EdgeDoc { source: 1, target: 3 });
        let err = compile(&doc, &Map::new()).unwrap_err();
        assert_eq!(err.tag(), "CompileError");
        assert_eq!(kind_of(err), CompileErrorKind::ArityViolation);

        let mut doc = lineal();
        doc.content.edges.push(crate::dag::EdgeDoc { source: 3, target: 2 });
        assert_eq!(kind_of(compile(&doc, &Map::new()).unwrap_err()), CompileErrorKind::ArityViolation);
    }

    #[test]
    fn join_acepta_dos_entradas_en_orden_de_llegada() {
        let doc = etl(json!({
            "nodes": [
                {"id": 1, "type": "source", "subtype": "json", "config": {"records": [{"id": 1}]}},
                {"id": 2, "type": "source", "subtype": "json", "config": {"records": [{"id": 1}]}},
                {"id": 3, "type": "transform", "subtype": "join", "config": {"join_cols": "id"}}
            ],
            "edges": [{"source": 2, "target": 3}, {"source": 1, "target": 3}]
        }));
        let c = compile(&doc, &Map::new()).unwrap();
        assert_eq!(c.dag.predecessors(3), vec![2, 1]);
    }

    #[test]
    fn tipos_y_subtipos_desconocidos() {
        let doc = etl(json!({"nodes": [{"id": 1, "type": "sink", "subtype": "csv"}]}));
        assert_eq!(kind_of(compile(&doc, &Map::new()).unwrap_err()), CompileErrorKind::UnknownKind);

        let doc = etl(json!({"nodes": [{"id": 4, "type": "transform", "subtype": "magia"}]}));
        match compile(&doc, &Map::new()).unwrap_err() {
            EtlError::Compile { kind, node_id, .. } => {
                assert_eq!(kind, CompileErrorKind::UnknownSubtype);
                assert_eq!(node_id, Some(4));
            }
            other => panic!("{other:?}"),
        }

        let doc = etl(json!({"nodes": [{"id": 1, "type": "source", "subtype": "csv"}, {"id": 1, "type": "source", "subtype": "csv"}]}));
        assert_eq!(kind_of(compile(&doc, &Map::new()).unwrap_err()), CompileErrorKind::DuplicateNode);
    }
}
