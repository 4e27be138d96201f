//! Configuración tipada de cada nodo.
//!
//! El documento guarda la configuración como un mapa JSON libre; aquí se
//! valida contra un registro concreto por subtipo (`NodeOp`). Las overrides
//! ya se aplicaron sobre el mapa antes de llegar aquí.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::dag::{NodeId, NodeKind};
use crate::error::{CompileErrorKind, EtlError, Result};
use crate::io::file::{FileFormat, FileSink, FileSource};
use crate::io::http::{ApiSink, ApiSource};
use crate::io::sql::{DbSink, DbSource};
use crate::transforms::TransformOp;

pub const SOURCE_SUBTYPES: &[&str] = &["csv", "excel", "json", "parquet", "database", "api"];

#[derive(Debug, Clone)]
pub enum NodeOp {
    Source(SourceConfig),
    Transform(TransformOp),
    Destination(SinkConfig),
}

#[derive(Debug, Clone)]
pub enum SourceConfig {
    File(FileSource),
    Database(DbSource),
    Api(ApiSource),
}

#[derive(Debug, Clone)]
pub enum SinkConfig {
    File(FileSink),
    Database(DbSink),
    Api(ApiSink),
}

impl NodeOp {
    /// Valida `subtype` (ya normalizado) y parsea la configuración.
    pub fn parse(id: NodeId, kind: NodeKind, subtype: &str, config: &Map<String, Value>) -> Result<NodeOp> {
        let unknown = || {
            EtlError::compile(
                CompileErrorKind::UnknownSubtype,
                Some(id),
                format!("nodo {id}: subtipo '{subtype}' desconocido para {}", kind.as_str()),
            )
        };
        let in_node = |e: EtlError| match e {
            EtlError::Config(msg) => EtlError::config(format!("nodo {id} ({subtype}): {msg}")),
            other => other,
        };

        match kind {
            NodeKind::Source => {
                let cfg = match subtype {
                    "csv" | "excel" | "json" | "parquet" => {
                        let mut src: FileSource = parse_config(config).map_err(in_node)?;
                        src.format = FileFormat::parse(subtype).ok_or_else(unknown)?;
                        SourceConfig::File(src)
                    }
                    "database" => SourceConfig::Database(parse_config(config).map_err(in_node)?),
                    "api" => SourceConfig::Api(parse_config(config).map_err(in_node)?),
                    _ => return Err(unknown()),
                };
                Ok(NodeOp::Source(cfg))
            }
            NodeKind::Destination => {
                let cfg = match subtype {
                    "csv" | "excel" | "json" | "parquet" => {
                        let mut sink: FileSink = parse_config(config).map_err(in_node)?;
                        sink.format = FileFormat::parse(subtype).ok_or_else(unknown)?;
                        SinkConfig::File(sink)
                    }
                    "database" => SinkConfig::Database(parse_config(config).map_err(in_node)?),
                    "api" => SinkConfig::Api(parse_config(config).map_err(in_node)?),
                    _ => return Err(unknown()),
                };
                Ok(NodeOp::Destination(cfg))
            }
            NodeKind::Transform => match TransformOp::parse(subtype, config) {
                Ok(Some(op)) => Ok(NodeOp::Transform(op)),
                Ok(None) => Err(unknown()),
                Err(e) => Err(in_node(e)),
            },
        }
    }

    pub fn input_arity(&self) -> usize {
        match self {
            NodeOp::Source(_) => 0,
            NodeOp::Transform(op) => op.input_arity(),
            NodeOp::Destination(_) => 1,
        }
    }
}

/// Deserializa un registro de configuración desde el mapa del nodo.
pub fn parse_config<T: DeserializeOwned>(config: &Map<String, Value>) -> Result<T> {
    serde_json::from_value(Value::Object(config.clone())).map_err(|e| EtlError::config(e.to_string()))
}

/* =========================
   Selección y renombrado (post-paso de todos los nodos)
   ========================= */

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostStep {
    /// Columnas a conservar, en orden; vacío = sin restricción.
    pub output_cols: Vec<String>,
    /// Pares (viejo, nuevo); `viejo` puede venir calificado.
    pub renames: Vec<(String, String)>,
}

impl PostStep {
    pub fn from_config(config: &Map<String, Value>) -> Result<PostStep> {
        let output_cols = match config.get("output_cols") {
            Some(v) => flex::list_from_value(v),
            None => Vec::new(),
        };

        let renames = match config.get("column_rename") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Object(map)) => map
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|n| (k.trim().to_string(), n.trim().to_string())))
                .filter(|(k, n)| !k.is_empty() && !n.is_empty())
                .collect(),
            Some(v) => flex::list_from_value(v)
                .into_iter()
                .map(|pair| match pair.split_once(':') {
                    Some((old, new)) if !old.trim().is_empty() && !new.trim().is_empty() => {
                        Ok((old.trim().to_string(), new.trim().to_string()))
                    }
                    _ => Err(EtlError::config(format!(
                        "column_rename: par '{pair}' inválido, se esperaba viejo:nuevo"
                    ))),
                })
                .collect::<Result<Vec<_>>>()?,
        };

        Ok(PostStep { output_cols, renames })
    }

    pub fn is_noop(&self) -> bool {
        self.output_cols.is_empty() && self.renames.is_empty()
    }
}

/* =========================
   Deserializadores tolerantes
   ========================= */

/// La UI guarda números y booleanos a veces como texto, y las listas como
/// texto separado por comas. Estos helpers aceptan ambas formas.
pub mod flex {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    use crate::dag::NodeId;

    pub fn id_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        match Value::deserialize(d)? {
            Value::String(s) => Ok(s),
            Value::Number(n) => Ok(n.to_string()),
            other => Err(D::Error::custom(format!("id inválido: {other}"))),
        }
    }

    pub fn node_id<'de, D: Deserializer<'de>>(d: D) -> Result<NodeId, D::Error> {
        match Value::deserialize(d)? {
            Value::Number(n) => n
                .as_i64()
                .ok_or_else(|| D::Error::custom(format!("id de nodo inválido: {n}"))),
            Value::String(s) => s
                .trim()
                .parse()
                .map_err(|_| D::Error::custom(format!("id de nodo inválido: '{s}'"))),
            other => Err(D::Error::custom(format!("id de nodo inválido: {other}"))),
        }
    }

    pub fn opt_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Null => None,
            Value::String(s) if s.trim().is_empty() => None,
            Value::String(s) => Some(s),
            other => Some(other.to_string()),
        })
    }

    pub fn string_list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
        Ok(list_from_value(&Value::deserialize(d)?))
    }

    pub fn opt_usize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<usize>, D::Error> {
        let v = Value::deserialize(d)?;
        match &v {
            Value::Null => Ok(None),
            Value::String(s) if s.trim().is_empty() => Ok(None),
            _ => usize_from_value(&v)
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("se esperaba un entero no negativo: {v}"))),
        }
    }

    pub fn usize<'de, D: Deserializer<'de>>(d: D) -> Result<usize, D::Error> {
        let v = Value::deserialize(d)?;
        usize_from_value(&v).ok_or_else(|| D::Error::custom(format!("se esperaba un entero no negativo: {v}")))
    }

    pub fn opt_i64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
        let v = Value::deserialize(d)?;
        match &v {
            Value::Null => Ok(None),
            Value::String(s) if s.trim().is_empty() => Ok(None),
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("se esperaba un entero: {v}"))),
            Value::String(s) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| D::Error::custom(format!("se esperaba un entero: '{s}'"))),
            _ => Err(D::Error::custom(format!("se esperaba un entero: {v}"))),
        }
    }

    pub fn opt_f64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<f64>, D::Error> {
        let v = Value::deserialize(d)?;
        match &v {
            Value::Null => Ok(None),
            Value::String(s) if s.trim().is_empty() => Ok(None),
            Value::Number(n) => Ok(n.as_f64()),
            Value::String(s) => s
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| D::Error::custom(format!("se esperaba un número: '{s}'"))),
            _ => Err(D::Error::custom(format!("se esperaba un número: {v}"))),
        }
    }

    pub fn bool<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        let v = Value::deserialize(d)?;
        bool_from_value(&v).ok_or_else(|| D::Error::custom(format!("se esperaba un booleano: {v}")))
    }

    pub fn opt_char<'de, D: Deserializer<'de>>(d: D) -> Result<Option<char>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::String(s) if s == "\\t" => Some('\t'),
            Value::String(s) => s.chars().next(),
            _ => None,
        })
    }

    /// Lista de registros: array JSON, un único objeto o texto con JSON.
    pub fn list_or_json<'de, D, T>(d: D) -> Result<Vec<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: serde::de::DeserializeOwned,
    {
        let v = match Value::deserialize(d)? {
            Value::Null => return Ok(Vec::new()),
            Value::String(s) if s.trim().is_empty() => return Ok(Vec::new()),
            Value::String(s) => {
                serde_json::from_str(&s).map_err(|e| D::Error::custom(format!("JSON inválido: {e}")))?
            }
            other => other,
        };
        let v = match v {
            Value::Object(_) => Value::Array(vec![v]),
            other => other,
        };
        serde_json::from_value(v).map_err(D::Error::custom)
    }

    /// Números como array o como texto separado por comas.
    pub fn f64_list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<f64>, D::Error> {
        let v = Value::deserialize(d)?;
        let items: Vec<Value> = match v {
            Value::Array(items) => items,
            other => list_from_value(&other).into_iter().map(Value::String).collect(),
        };
        items
            .iter()
            .map(|i| match i {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            })
            .map(|f| f.ok_or_else(|| D::Error::custom(format!("se esperaba una lista de números: {items:?}"))))
            .collect()
    }

    pub fn list_from_value(v: &Value) -> Vec<String> {
        match v {
            Value::Null => Vec::new(),
            Value::Array(items) => items
                .iter()
                .filter_map(|i| match i {
                    Value::String(s) => Some(s.trim().to_string()),
                    Value::Null => None,
                    other => Some(other.to_string()),
                })
                .filter(|s| !s.is_empty())
                .collect(),
            Value::String(s) => s
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
            other => vec![other.to_string()],
        }
    }

    pub fn usize_from_value(v: &Value) -> Option<usize> {
        match v {
            Value::Number(n) => n
                .as_u64()
                .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
                .and_then(|u| usize::try_from(u).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn bool_from_value(v: &Value) -> Option<bool> {
        match v {
            Value::Bool(b) => Some(*b),
            Value::Null => Some(false),
            Value::Number(n) => n.as_f64().map(|f| f != 0.0),
            Value::String(s) => crate::value::parse_bool(s).or(s.trim().is_empty().then_some(false)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn post_step_acepta_texto_y_listas() {
        let p = PostStep::from_config(&map(json!({
            "output_cols": "Origen1.id, name ,",
            "column_rename": "Origen1.id:ID, name:Nombre"
        })))
        .unwrap();
        assert_eq!(p.output_cols, vec!["Origen1.id", "name"]);
        assert_eq!(
            p.renames,
            vec![("Origen1.id".to_string(), "ID".to_string()), ("name".into(), "Nombre".into())]
        );

        let p = PostStep::from_config(&map(json!({"output_cols": ["a", "b"]}))).unwrap();
        assert_eq!(p.output_cols, vec!["a", "b"]);
        assert!(p.renames.is_empty());
    }

    #[test]
    fn rename_mal_formado_es_config_error() {
        let err = PostStep::from_config(&map(json!({"column_rename": "a-b"}))).unwrap_err();
        assert_eq!(err.tag(), "ConfigError");
    }

    #[test]
    fn subtipo_desconocido_es_compile_error() {
        let err = NodeOp::parse(4, NodeKind::Source, "xml", &Map::new()).unwrap_err();
        match err {
            EtlError::Compile { kind, node_id, .. } => {
                assert_eq!(kind, CompileErrorKind::UnknownSubtype);
                assert_eq!(node_id, Some(4));
            }
            other => panic!("error inesperado: {other:?}"),
        }
    }

    #[test]
    fn aridad_por_tipo_de_nodo() {
        let src = NodeOp::parse(1, NodeKind::Source, "csv", &map(json!({"path": "a.csv"}))).unwrap();
        assert_eq!(src.input_arity(), 0);
        let join = NodeOp::parse(2, NodeKind::Transform, "join", &map(json!({"join_cols": "id"}))).unwrap();
        assert_eq!(join.input_arity(), 2);
        let dst = NodeOp::parse(3, NodeKind::Destination, "json", &map(json!({"path": "o.json"}))).unwrap();
        assert_eq!(dst.input_arity(), 1);
    }
}
