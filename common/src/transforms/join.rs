//! Join por igualdad y sugerencia de claves.
//!
//! Orden de salida:
//! - inner/left: orden de la izquierda (y de la derecha dentro de cada clave).
//! - right: orden de la derecha.
//! - outer: primero las filas guiadas por la izquierda, luego las filas que
//!   sólo existen a la derecha, en su orden.
//!
//! Las columnas clave de la derecha no se repiten en la salida; en filas que
//! sólo vienen de la derecha la clave izquierda toma su valor.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Deserializer};
use serde_json::Value as Json;

use crate::config::flex;
use crate::error::{EtlError, Result};
use crate::frame::{Column, DataFrame};
use crate::transforms::select::require_column;
use crate::value::{unify_types, KeyValue, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinType {
    #[default]
    Inner,
    Left,
    Right,
    #[serde(alias = "full")]
    Outer,
}

fn default_suffix() -> String {
    "_right".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct JoinSpec {
    #[serde(default, alias = "how")]
    pub join_type: JoinType,
    #[serde(default, deserialize_with = "flex::string_list")]
    pub join_cols: Vec<String>,
    #[serde(default, deserialize_with = "join_pairs")]
    pub join_pairs: Vec<(String, String)>,
    #[serde(default = "default_suffix")]
    pub right_suffix: String,
    #[serde(default, deserialize_with = "flex::bool")]
    pub swap_inputs: bool,
}

impl Default for JoinSpec {
    fn default() -> Self {
        Self {
            join_type: JoinType::Inner,
            join_cols: Vec::new(),
            join_pairs: Vec::new(),
            right_suffix: default_suffix(),
            swap_inputs: false,
        }
    }
}

/// "l:r,l2:r2", ["l:r"], [["l","r"]] o [{"left":"l","right":"r"}].
fn join_pairs<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<(String, String)>, D::Error> {
    use serde::de::Error as _;
    let v = Json::deserialize(d)?;
    let items: Vec<Json> = match v {
        Json::Array(items) => items,
        other => flex::list_from_value(&other).into_iter().map(Json::String).collect(),
    };
    items
        .into_iter()
        .map(|item| {
            let pair = match &item {
                Json::String(s) => s
                    .split_once(':')
                    .map(|(l, r)| (l.trim().to_string(), r.trim().to_string())),
                Json::Array(lr) if lr.len() == 2 => lr[0].as_str().zip(lr[1].as_str()).map(|(l, r)| (l.to_string(), r.to_string())),
                Json::Object(o) => o
                    .get("left")
                    .and_then(Json::as_str)
                    .zip(o.get("right").and_then(Json::as_str))
                    .map(|(l, r)| (l.to_string(), r.to_string())),
                _ => None,
            };
            pair.filter(|(l, r)| !l.is_empty() && !r.is_empty())
                .ok_or_else(|| D::Error::custom(format!("join_pairs: par inválido {item}")))
        })
        .collect()
}

impl JoinSpec {
    fn pairs(&self) -> Vec<(String, String)> {
        if !self.join_pairs.is_empty() {
            return self.join_pairs.clone();
        }
        self.join_cols.iter().map(|c| (c.clone(), c.clone())).collect()
    }

    pub fn apply(&self, primary: &DataFrame, secondary: &DataFrame, warnings: &mut Vec<String>) -> Result<DataFrame> {
        let (left, right) = if self.swap_inputs {
            (secondary, primary)
        } else {
            (primary, secondary)
        };

        let mut pairs = self.pairs();
        if pairs.is_empty() {
            pairs = suggest_join_pairs(left, right);
            if pairs.is_empty() {
                return Err(EtlError::transform("join sin columnas clave y sin candidatas comunes"));
            }
            let shown: Vec<String> = pairs.iter().map(|(l, r)| format!("{l}:{r}")).collect();
            warnings.push(format!("join sin claves configuradas; se usan las sugeridas {}", shown.join(",")));
        }

        let mut lkeys = Vec::with_capacity(pairs.len());
        let mut rkeys = Vec::with_capacity(pairs.len());
        for (l, r) in &pairs {
            lkeys.push(require_column(left, l)?);
            rkeys.push(require_column(right, r)?);
        }

        let rows = match_rows(left, right, &lkeys, &rkeys, self.join_type)?;
        build_output(left, right, &lkeys, &rkeys, &rows, &self.right_suffix)
    }
}

type RowPair = (Option<usize>, Option<usize>);

/// Clave compuesta de una fila; `None` si alguna parte es nula (NULL no
/// empareja con NULL).
fn row_key(df: &DataFrame, keys: &[String], i: usize) -> Result<Option<Vec<KeyValue>>> {
    let mut out = Vec::with_capacity(keys.len());
    for k in keys {
        let v = df.require(k)?.get(i);
        if v.is_null() {
            return Ok(None);
        }
        out.push(v.key());
    }
    Ok(Some(out))
}

fn index_rows(df: &DataFrame, keys: &[String]) -> Result<HashMap<Vec<KeyValue>, Vec<usize>>> {
    let mut index: HashMap<Vec<KeyValue>, Vec<usize>> = HashMap::new();
    for i in 0..df.height() {
        if let Some(k) = row_key(df, keys, i)? {
            index.entry(k).or_default().push(i);
        }
    }
    Ok(index)
}

fn match_rows(
    left: &DataFrame,
    right: &DataFrame,
    lkeys: &[String],
    rkeys: &[String],
    how: JoinType,
) -> Result<Vec<RowPair>> {
    let mut rows = Vec::new();

    if how == JoinType::Right {
        let lindex = index_rows(left, lkeys)?;
        for j in 0..right.height() {
            match row_key(right, rkeys, j)?.and_then(|k| lindex.get(&k)) {
                Some(ls) => rows.extend(ls.iter().map(|&i| (Some(i), Some(j)))),
                None => rows.push((None, Some(j))),
            }
        }
        return Ok(rows);
    }

    let rindex = index_rows(right, rkeys)?;
    let mut matched_right: HashSet<usize> = HashSet::new();
    for i in 0..left.height() {
        match row_key(left, lkeys, i)?.and_then(|k| rindex.get(&k)) {
            Some(rs) => {
                for &j in rs {
                    rows.push((Some(i), Some(j)));
                    matched_right.insert(j);
                }
            }
            None if how != JoinType::Inner => rows.push((Some(i), None)),
            None => {}
        }
    }
    if how == JoinType::Outer {
        rows.extend((0..right.height()).filter(|j| !matched_right.contains(j)).map(|j| (None, Some(j))));
    }
    Ok(rows)
}

fn build_output(
    left: &DataFrame,
    right: &DataFrame,
    lkeys: &[String],
    rkeys: &[String],
    rows: &[RowPair],
    suffix: &str,
) -> Result<DataFrame> {
    let lidx: Vec<Option<usize>> = rows.iter().map(|(l, _)| *l).collect();
    let ridx: Vec<Option<usize>> = rows.iter().map(|(_, r)| *r).collect();

    let mut columns: Vec<Column> = Vec::with_capacity(left.width() + right.width());
    for col in left.columns() {
        let taken = col.take_opt(&lidx);
        let key_pos = lkeys.iter().position(|k| k == col.name());
        let column = match key_pos {
            Some(p) => {
                let rcol = right.require(&rkeys[p])?;
                let values = rows
                    .iter()
                    .zip(taken.values())
                    .map(|((l, r), v)| match (l, r) {
                        (None, Some(j)) => rcol.get(*j).clone(),
                        _ => v.clone(),
                    })
                    .collect::<Vec<Value>>();
                Column::new(col.name(), unify_types(col.dtype(), rcol.dtype()), values)
            }
            None => taken,
        };
        columns.push(column);
    }

    let mut names: HashSet<String> = columns.iter().map(|c| c.name().to_string()).collect();
    for col in right.columns() {
        if rkeys.iter().any(|k| k == col.name()) {
            continue;
        }
        let mut name = col.name().to_string();
        while names.contains(&name) {
            name.push_str(suffix);
        }
        names.insert(name.clone());
        columns.push(col.take_opt(&ridx).renamed(name));
    }

    DataFrame::new(columns)
}

/* =========================
   Sugerencia de claves
   ========================= */

fn canonical(name: &str) -> String {
    name.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Propone hasta 3 pares de columnas para unir dos tablas: primero nombres
/// idénticos, si no hay, nombres iguales tras canonizar (minúsculas y sólo
/// alfanuméricos). Dentro de cada criterio gana la mayor cardinalidad.
pub fn suggest_join_pairs(left: &DataFrame, right: &DataFrame) -> Vec<(String, String)> {
    let cardinality = |l: &Column, r: &Column| l.n_unique().min(r.n_unique());

    let mut exact: Vec<(usize, String, String)> = left
        .columns()
        .iter()
        .filter_map(|l| right.column(l.name()).map(|r| (cardinality(l, r), l.name().to_string(), r.name().to_string())))
        .collect();

    if exact.is_empty() {
        for l in left.columns() {
            let cl = canonical(l.name());
            if cl.is_empty() {
                continue;
            }
            if let Some(r) = right.columns().iter().find(|r| canonical(r.name()) == cl) {
                exact.push((cardinality(l, r), l.name().to_string(), r.name().to_string()));
            }
        }
    }

    // orden estable: empate = orden de columnas de la izquierda
    exact.sort_by(|a, b| b.0.cmp(&a.0));
    exact.into_iter().take(3).map(|(_, l, r)| (l, r)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(v: Json) -> DataFrame {
        DataFrame::from_records(v.as_array().unwrap()).unwrap()
    }

    fn left() -> DataFrame {
        frame(json!([{"id": 1, "x": "a"}, {"id": 2, "x": "b"}]))
    }

    fn right() -> DataFrame {
        frame(json!([{"id": 2, "y": 10}, {"id": 3, "y": 20}]))
    }

    fn join(how: &str) -> JoinSpec {
        serde_json::from_value(json!({"join_type": how, "join_cols": "id"})).unwrap()
    }

    #[test]
    fn inner_une_por_clave() {
        let out = join("inner").apply(&left(), &right(), &mut Vec::new()).unwrap();
        assert_eq!(out.to_records(), vec![json!({"id": 2, "x": "b", "y": 10})]);
    }

    #[test]
    fn left_right_y_outer() {
        let l = join("left").apply(&left(), &right(), &mut Vec::new()).unwrap();
        assert_eq!(
            l.to_records(),
            vec![json!({"id": 1, "x": "a", "y": null}), json!({"id": 2, "x": "b", "y": 10})]
        );

        let r = join("right").apply(&left(), &right(), &mut Vec::new()).unwrap();
        assert_eq!(
            r.to_records(),
            vec![json!({"id": 2, "x": "b", "y": 10}), json!({"id": 3, "x": null, "y": 20})]
        );

        let o = join("outer").apply(&left(), &right(), &mut Vec::new()).unwrap();
        let ids: Vec<Value> = o.column("id").unwrap().values().to_vec();
        assert_eq!(ids, vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
    }

    #[test]
    fn null_no_empareja_con_null() {
        let l = frame(json!([{"id": null, "x": 1}]));
        let r = frame(json!([{"id": null, "y": 2}]));
        let out = join("inner").apply(&l, &r, &mut Vec::new()).unwrap();
        assert_eq!(out.height(), 0);
    }

    #[test]
    fn sufijo_en_colisiones_y_pares_con_nombres_distintos() {
        let l = frame(json!([{"cod": 1, "name": "a"}]));
        let r = frame(json!([{"code": 1, "name": "b"}]));
        let spec: JoinSpec = serde_json::from_value(json!({"join_pairs": "cod:code", "right_suffix": "_r"})).unwrap();
        let out = spec.apply(&l, &r, &mut Vec::new()).unwrap();
        assert_eq!(out.column_names(), vec!["cod", "name", "name_r"]);
    }

    #[test]
    fn swap_inputs_invierte_lados() {
        let mut spec = join("left");
        spec.swap_inputs = true;
        let out = spec.apply(&left(), &right(), &mut Vec::new()).unwrap();
        assert_eq!(out.column_names(), vec!["id", "y", "x"]);
        assert_eq!(out.height(), 2);
    }

    #[test]
    fn columna_clave_desconocida() {
        let spec: JoinSpec = serde_json::from_value(json!({"join_cols": "nope"})).unwrap();
        let err = spec.apply(&left(), &right(), &mut Vec::new()).unwrap_err();
        assert_eq!(err.tag(), "TransformError");
    }

    #[test]
    fn sin_claves_usa_sugeridas_con_aviso() {
        let mut warnings = Vec::new();
        let out = JoinSpec::default().apply(&left(), &right(), &mut warnings).unwrap();
        assert_eq!(out.height(), 1);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn sugerencias_exactas_y_canonicas() {
        let l = frame(json!([{"id": 1, "tipo": "a"}, {"id": 2, "tipo": "a"}]));
        let r = frame(json!([{"tipo": "a", "id": 1}, {"tipo": "b", "id": 2}]));
        assert_eq!(
            suggest_join_pairs(&l, &r),
            vec![("id".to_string(), "id".to_string()), ("tipo".to_string(), "tipo".to_string())]
        );

        let l = frame(json!([{"Customer ID": 1}]));
        let r = frame(json!([{"customer_id": 1}]));
        assert_eq!(suggest_join_pairs(&l, &r), vec![("Customer ID".to_string(), "customer_id".to_string())]);
    }
}
