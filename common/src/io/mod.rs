//! Lectura y escritura de orígenes y destinos.

pub mod file;
pub mod http;
pub mod sql;

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::{EtlError, Result};

const WRAPPER_KEYS: &[&str] = &["data", "records", "items", "results"];

/// Rutas relativas se resuelven contra el directorio del proyecto.
pub fn resolve_path(base: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}

/// Crear carpeta de salida si hace falta.
pub fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .map_err(|e| EtlError::io(format!("no se pudo crear {}: {e}", parent.display())))?;
        }
    }
    Ok(())
}

/// Extrae la lista de registros de un documento JSON.
///
/// - `records_path` ("a.b.c") navega primero dentro del documento.
/// - Un array se toma tal cual; los elementos que no son objetos se envuelven
///   como `{"value": x}`.
/// - Un objeto que envuelve un array bajo `data`/`records`/`items`/`results`
///   devuelve ese array; cualquier otro objeto es un único registro.
pub fn records_from_json(doc: Value, records_path: Option<&str>) -> Result<Vec<Value>> {
    let mut cur = doc;
    if let Some(path) = records_path.filter(|p| !p.trim().is_empty()) {
        for part in path.split('.') {
            cur = match cur {
                Value::Object(mut obj) => obj.remove(part).ok_or_else(|| {
                    EtlError::io(format!("records_path: la clave '{part}' no existe en la respuesta"))
                })?,
                Value::Array(mut items) => {
                    let idx: usize = part.parse().map_err(|_| {
                        EtlError::io(format!("records_path: '{part}' no es un índice válido"))
                    })?;
                    if idx >= items.len() {
                        return Err(EtlError::io(format!("records_path: índice {idx} fuera de rango")));
                    }
                    items.swap_remove(idx)
                }
                _ => return Err(EtlError::io(format!("records_path: no se puede entrar en '{part}'"))),
            };
        }
    }

    match cur {
        Value::Array(items) => Ok(items.into_iter().map(wrap_scalar).collect()),
        Value::Object(mut obj) => {
            for key in WRAPPER_KEYS {
                if matches!(obj.get(*key), Some(Value::Array(_))) {
                    if let Some(Value::Array(items)) = obj.remove(*key) {
                        return Ok(items.into_iter().map(wrap_scalar).collect());
                    }
                }
            }
            Ok(vec![Value::Object(obj)])
        }
        Value::Null => Ok(Vec::new()),
        other => Ok(vec![wrap_scalar(other)]),
    }
}

fn wrap_scalar(v: Value) -> Value {
    match v {
        Value::Object(_) => v,
        other => serde_json::json!({ "value": other }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn records_from_json_formas_habituales() {
        let a = records_from_json(json!([{"a": 1}, {"a": 2}]), None).unwrap();
        assert_eq!(a.len(), 2);

        let b = records_from_json(json!({"data": [{"a": 1}], "total": 1}), None).unwrap();
        assert_eq!(b, vec![json!({"a": 1})]);

        let c = records_from_json(json!({"a": 1}), None).unwrap();
        assert_eq!(c, vec![json!({"a": 1})]);

        let d = records_from_json(json!([1, 2]), None).unwrap();
        assert_eq!(d, vec![json!({"value": 1}), json!({"value": 2})]);
    }

    #[test]
    fn records_path_navega_objetos_y_arrays() {
        let doc = json!({"resp": {"pages": [{"rows": [{"x": 1}]}]}});
        let r = records_from_json(doc, Some("resp.pages.0.rows")).unwrap();
        assert_eq!(r, vec![json!({"x": 1})]);

        let err = records_from_json(json!({"a": 1}), Some("b")).unwrap_err();
        assert_eq!(err.tag(), "IOError");
    }

    #[test]
    fn resolve_path_relativa_al_proyecto() {
        let base = Path::new("/proyectos/demo");
        assert_eq!(resolve_path(base, "in/a.csv"), PathBuf::from("/proyectos/demo/in/a.csv"));
        assert_eq!(resolve_path(base, "/tmp/a.csv"), PathBuf::from("/tmp/a.csv"));
    }
}
