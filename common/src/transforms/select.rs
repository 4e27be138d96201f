//! Post-paso de selección y renombrado, común a todos los nodos.

use std::collections::HashSet;

use crate::config::PostStep;
use crate::error::{EtlError, Result};
use crate::frame::DataFrame;

/// Busca una columna aceptando nombres calificados ("Origen1.col").
/// El nombre exacto gana sobre el nombre sin calificador.
pub fn resolve_column(df: &DataFrame, name: &str) -> Option<String> {
    let name = name.trim();
    if df.column(name).is_some() {
        return Some(name.to_string());
    }
    let (_, bare) = name.split_once('.')?;
    df.column(bare.trim()).map(|c| c.name().to_string())
}

/// Como `resolve_column`, pero una columna ausente es `TransformError`.
pub fn require_column(df: &DataFrame, name: &str) -> Result<String> {
    resolve_column(df, name).ok_or_else(|| {
        EtlError::transform(format!(
            "la columna '{name}' no existe (disponibles: {})",
            df.column_names().join(", ")
        ))
    })
}

/// Tope de combinaciones al buscar los nombres de origen de un frame.
const MAX_PREIMAGES: usize = 4096;

/// Aplica `output_cols` y luego `column_rename`.
///
/// Los renombres son simultáneos: cada columna toma el nombre del primer par
/// que la nombra, según los nombres que tenía antes del paso. Si el frame ya
/// es la salida de este mismo post-paso, se reconstruyen sus nombres de
/// origen y el resultado no cambia. Las columnas desconocidas en
/// `output_cols` se descartan en silencio.
pub fn apply_post(df: &DataFrame, post: &PostStep) -> Result<DataFrame> {
    if post.is_noop() {
        return Ok(df.clone());
    }

    let current = df.column_names();
    let names = if post.renames.is_empty() {
        current
    } else {
        preimage(&current, post).unwrap_or(current)
    };

    let keep: Vec<usize> = if post.output_cols.is_empty() {
        (0..names.len()).collect()
    } else {
        selected(&names, &post.output_cols)
    };
    let kept: Vec<String> = keep.iter().map(|&i| names[i].clone()).collect();
    let finals = rename_all(&kept, post)?;

    let columns = keep
        .iter()
        .zip(finals)
        .map(|(&i, name)| {
            let c = &df.columns()[i];
            if c.name() == name {
                c.clone()
            } else {
                c.renamed(name)
            }
        })
        .collect();
    DataFrame::new(columns)
}

fn bare(name: &str) -> &str {
    name.split_once('.').map(|(_, b)| b).unwrap_or(name).trim()
}

// como resolve_column, sobre una lista de nombres
fn position(names: &[String], wanted: &str) -> Option<usize> {
    let wanted = wanted.trim();
    names.iter().position(|n| n == wanted).or_else(|| {
        let (_, b) = wanted.split_once('.')?;
        names.iter().position(|n| n == b.trim())
    })
}

fn selected(names: &[String], wanted: &[String]) -> Vec<usize> {
    let mut keep = Vec::new();
    for w in wanted {
        if let Some(i) = position(names, w) {
            if !keep.contains(&i) {
                keep.push(i);
            }
        }
    }
    keep
}

/// Nombre final de `name` dentro de un frame con columnas `present`.
fn renamed_as<'a>(post: &'a PostStep, name: &'a str, present: &[String]) -> &'a str {
    post.renames
        .iter()
        .find(|(old, new)| {
            new != name && (old == name || (bare(old) == name && !present.iter().any(|p| p == old)))
        })
        .map(|(_, new)| new.as_str())
        .unwrap_or(name)
}

fn rename_all(names: &[String], post: &PostStep) -> Result<Vec<String>> {
    let out: Vec<String> = names.iter().map(|n| renamed_as(post, n, names).to_string()).collect();
    let mut seen = HashSet::new();
    for n in &out {
        if !seen.insert(n.as_str()) {
            return Err(EtlError::RenameCollision(n.clone()));
        }
    }
    Ok(out)
}

/// Nombres que pudo tener `name` antes de renombrar: primero los orígenes de
/// los pares que llevan a él, después el propio nombre si ningún par lo cambia.
fn sources_of(name: &str, post: &PostStep) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for (old, _) in &post.renames {
        for candidate in [bare(old), old.as_str()] {
            let present = [candidate.to_string()];
            if candidate != name
                && renamed_as(post, candidate, &present) == name
                && !out.iter().any(|c| c == candidate)
            {
                out.push(candidate.to_string());
            }
        }
    }
    if renamed_as(post, name, &[name.to_string()]) == name {
        out.push(name.to_string());
    }
    out
}

/// Nombres de origen de un frame que ya pasó por `post`, o `None` si no lo es.
/// Entre varias reconstrucciones gana la que `output_cols` deja intacta.
fn preimage(names: &[String], post: &PostStep) -> Option<Vec<String>> {
    let candidates: Vec<Vec<String>> = names.iter().map(|n| sources_of(n, post)).collect();
    let total = candidates
        .iter()
        .try_fold(1usize, |acc, c| acc.checked_mul(c.len()).filter(|t| *t <= MAX_PREIMAGES))?;

    let mut fallback = None;
    for k in 0..total {
        // el último nombre varía más rápido
        let mut rest = k;
        let mut origin = vec![String::new(); names.len()];
        for (i, c) in candidates.iter().enumerate().rev() {
            origin[i] = c[rest % c.len()].clone();
            rest /= c.len();
        }

        let distinct = origin.iter().collect::<HashSet<_>>().len() == origin.len();
        if !distinct || rename_all(&origin, post).ok().as_deref() != Some(names) {
            continue;
        }
        if post.output_cols.is_empty() || selected(&origin, &post.output_cols).into_iter().eq(0..origin.len()) {
            return Some(origin);
        }
        if fallback.is_none() {
            fallback = Some(origin);
        }
    }
    fallback
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn df() -> DataFrame {
        DataFrame::from_records(&[json!({"id": 1, "name": "a", "x": true})]).unwrap()
    }

    fn post(cols: &[&str], renames: &[(&str, &str)]) -> PostStep {
        PostStep {
            output_cols: cols.iter().map(|s| s.to_string()).collect(),
            renames: renames.iter().map(|(a, b)| (a.to_string(), b.to_string())).collect(),
        }
    }

    #[test]
    fn selecciona_en_orden_y_quita_calificador() {
        let out = apply_post(&df(), &post(&["Origen2.name", "id", "nada"], &[])).unwrap();
        assert_eq!(out.column_names(), vec!["name", "id"]);
    }

    #[test]
    fn renombra_despues_de_seleccionar() {
        let out = apply_post(&df(), &post(&["id", "name"], &[("Origen1.id", "ID")])).unwrap();
        assert_eq!(out.column_names(), vec!["ID", "name"]);
    }

    #[test]
    fn colision_de_renombrado() {
        let err = apply_post(&df(), &post(&[], &[("id", "name")])).unwrap_err();
        assert_eq!(err, EtlError::RenameCollision("name".into()));
        assert_eq!(err.tag(), "TransformError");
    }

    #[test]
    fn renombres_encadenados_son_simultaneos_e_idempotentes() {
        let df = DataFrame::from_records(&[json!({"a": 1, "b": 2})]).unwrap();
        let p = post(&[], &[("a", "b"), ("b", "c")]);
        let once = apply_post(&df, &p).unwrap();
        assert_eq!(once.column_names(), vec!["b", "c"]);
        assert_eq!(once.column("b").unwrap().get(0), &crate::value::Value::Int(1));
        let twice = apply_post(&once, &p).unwrap();
        assert_eq!(once, twice);

        let p = post(&["b", "a"], &[("a", "b"), ("b", "c")]);
        let once = apply_post(&df, &p).unwrap();
        assert_eq!(once.column_names(), vec!["c", "b"]);
        assert_eq!(apply_post(&once, &p).unwrap(), once);
    }

    #[test]
    fn renombre_calificado_dos_veces() {
        let p = post(&["id", "name"], &[("Origen1.id", "ID")]);
        let once = apply_post(&df(), &p).unwrap();
        assert_eq!(apply_post(&once, &p).unwrap(), once);
    }

    #[test]
    fn aplicar_dos_veces_es_idempotente() {
        let p = post(&["name", "id"], &[("id", "ID"), ("name", "Nombre")]);
        let once = apply_post(&df(), &p).unwrap();
        let twice = apply_post(&once, &p).unwrap();
        assert_eq!(once, twice);
        assert_eq!(twice.column_names(), vec!["Nombre", "ID"]);
    }
}
