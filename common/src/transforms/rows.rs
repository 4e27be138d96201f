//! Operadores sobre filas: ordenar, deduplicar, recortar, nulos y explode.

use std::cmp::Ordering;
use std::collections::HashSet;

use serde::{Deserialize, Deserializer};
use serde_json::Value as Json;

use crate::config::flex;
use crate::error::{EtlError, Result};
use crate::frame::{Column, DataFrame};
use crate::transforms::select::require_column;
use crate::value::{cast_value, KeyValue, Value};

fn resolve_all(df: &DataFrame, names: &[String]) -> Result<Vec<String>> {
    names.iter().map(|n| require_column(df, n)).collect()
}

/// Columnas indicadas o, si no hay, todas.
fn subset_or_all(df: &DataFrame, subset: &[String]) -> Result<Vec<String>> {
    if subset.is_empty() {
        Ok(df.column_names())
    } else {
        resolve_all(df, subset)
    }
}

fn default_true() -> bool {
    true
}

/* ----- sort ----- */

/// `true`, `false` o una lista por columna.
fn bool_or_list<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<bool>, D::Error> {
    use serde::de::Error as _;
    let v = Json::deserialize(d)?;
    match &v {
        Json::Array(items) => items
            .iter()
            .map(|i| flex::bool_from_value(i).ok_or_else(|| D::Error::custom(format!("se esperaba un booleano: {i}"))))
            .collect(),
        other => flex::bool_from_value(other)
            .map(|b| vec![b])
            .ok_or_else(|| D::Error::custom(format!("se esperaba un booleano: {other}"))),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SortSpec {
    #[serde(alias = "cols", alias = "columns", deserialize_with = "flex::string_list")]
    pub sort_cols: Vec<String>,
    #[serde(default, alias = "desc", deserialize_with = "bool_or_list")]
    pub descending: Vec<bool>,
    #[serde(default = "default_true", deserialize_with = "flex::bool")]
    pub nulls_last: bool,
}

impl SortSpec {
    fn desc_for(&self, i: usize) -> bool {
        match self.descending.as_slice() {
            [] => false,
            [one] => *one,
            many => many.get(i).copied().unwrap_or(false),
        }
    }

    /// Orden estable; los nulos van al final (o al principio) sin importar
    /// la dirección.
    pub fn apply(&self, df: &DataFrame, warnings: &mut Vec<String>) -> Result<DataFrame> {
        if self.sort_cols.is_empty() {
            warnings.push("sort sin columnas".to_string());
            return Ok(df.clone());
        }
        let names = resolve_all(df, &self.sort_cols)?;
        let cols: Vec<&Column> = names.iter().map(|n| df.require(n)).collect::<Result<_>>()?;

        let mut rows: Vec<usize> = (0..df.height()).collect();
        rows.sort_by(|&a, &b| {
            for (k, col) in cols.iter().enumerate() {
                let (va, vb) = (col.get(a), col.get(b));
                let ord = match (va.is_null(), vb.is_null()) {
                    (true, true) => Ordering::Equal,
                    (true, false) if self.nulls_last => Ordering::Greater,
                    (true, false) => Ordering::Less,
                    (false, true) if self.nulls_last => Ordering::Less,
                    (false, true) => Ordering::Greater,
                    (false, false) if self.desc_for(k) => vb.total_cmp(va),
                    (false, false) => va.total_cmp(vb),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
        Ok(df.take(&rows))
    }
}

/* ----- unique ----- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Keep {
    #[default]
    First,
    Last,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UniqueSpec {
    #[serde(default, deserialize_with = "flex::string_list")]
    pub subset: Vec<String>,
    #[serde(default)]
    pub keep: Keep,
}

impl UniqueSpec {
    /// Conserva el orden original de las filas que sobreviven.
    pub fn apply(&self, df: &DataFrame) -> Result<DataFrame> {
        let names = subset_or_all(df, &self.subset)?;
        let cols: Vec<&Column> = names.iter().map(|n| df.require(n)).collect::<Result<_>>()?;
        let key = |i: usize| -> Vec<KeyValue> { cols.iter().map(|c| c.get(i).key()).collect() };

        let mut seen = HashSet::new();
        let mut keep: Vec<usize> = match self.keep {
            Keep::First => (0..df.height()).filter(|&i| seen.insert(key(i))).collect(),
            Keep::Last => (0..df.height()).rev().filter(|&i| seen.insert(key(i))).collect(),
        };
        keep.sort_unstable();
        Ok(df.take(&keep))
    }
}

/* ----- limit ----- */

#[derive(Debug, Clone, Deserialize)]
pub struct LimitSpec {
    #[serde(alias = "limit", deserialize_with = "flex::usize")]
    pub n: usize,
    #[serde(default, deserialize_with = "flex::opt_usize")]
    pub offset: Option<usize>,
}

impl LimitSpec {
    pub fn apply(&self, df: &DataFrame) -> DataFrame {
        df.slice(self.offset.unwrap_or(0), self.n)
    }
}

/* ----- fill_nulls / drop_nulls ----- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FillStrategy {
    #[default]
    Value,
    #[serde(alias = "ffill")]
    Forward,
    #[serde(alias = "bfill")]
    Backward,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FillNullsSpec {
    #[serde(default)]
    pub strategy: FillStrategy,
    #[serde(default, deserialize_with = "flex::string_list")]
    pub columns: Vec<String>,
    #[serde(default)]
    pub value: Option<Json>,
}

impl FillNullsSpec {
    pub fn validated(self) -> Result<Self> {
        if self.strategy == FillStrategy::Value && self.value.as_ref().map_or(true, Json::is_null) {
            return Err(EtlError::config("fill_nulls con strategy=value requiere 'value'"));
        }
        Ok(self)
    }

    /// En `value`, el valor se convierte al tipo de cada columna; si no
    /// convierte (texto en una columna numérica) la columna no cambia.
    pub fn apply(&self, df: &DataFrame) -> Result<DataFrame> {
        let names = subset_or_all(df, &self.columns)?;
        let fill = self.value.as_ref().map(Value::from_json).unwrap_or(Value::Null);
        let mut out = df.clone();
        for name in names {
            let col = out.require(&name)?;
            let mut values = col.values().to_vec();
            match self.strategy {
                FillStrategy::Value => {
                    let v = cast_value(&fill, col.dtype(), None);
                    if v.is_null() {
                        continue;
                    }
                    for cell in values.iter_mut().filter(|c| c.is_null()) {
                        *cell = v.clone();
                    }
                }
                FillStrategy::Forward => {
                    let mut last = Value::Null;
                    for cell in values.iter_mut() {
                        if cell.is_null() {
                            *cell = last.clone();
                        } else {
                            last = cell.clone();
                        }
                    }
                }
                FillStrategy::Backward => {
                    let mut next = Value::Null;
                    for cell in values.iter_mut().rev() {
                        if cell.is_null() {
                            *cell = next.clone();
                        } else {
                            next = cell.clone();
                        }
                    }
                }
            }
            let filled = Column::new(name, col.dtype(), values);
            out = out.with_column(filled)?;
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DropNullsSpec {
    #[serde(default, alias = "columns", deserialize_with = "flex::string_list")]
    pub subset: Vec<String>,
}

impl DropNullsSpec {
    pub fn apply(&self, df: &DataFrame) -> Result<DataFrame> {
        let names = subset_or_all(df, &self.subset)?;
        let cols: Vec<&Column> = names.iter().map(|n| df.require(n)).collect::<Result<_>>()?;
        let keep: Vec<bool> = (0..df.height())
            .map(|i| cols.iter().all(|c| !c.get(i).is_null()))
            .collect();
        Ok(df.filter(&keep))
    }
}

/* ----- explode ----- */

fn default_separator() -> String {
    ",".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExplodeSpec {
    pub column: String,
    #[serde(default = "default_separator", alias = "sep")]
    pub separator: String,
}

impl ExplodeSpec {
    fn parts(&self, cell: &Value) -> Vec<Value> {
        let Some(text) = cell.to_text() else {
            return vec![Value::Null];
        };
        let trimmed = text.trim();
        if trimmed.starts_with('[') {
            if let Ok(Json::Array(items)) = serde_json::from_str::<Json>(trimmed) {
                if items.is_empty() {
                    return vec![Value::Null];
                }
                return items.iter().map(Value::from_json).collect();
            }
        }
        if self.separator.is_empty() {
            return vec![Value::Str(text)];
        }
        text.split(self.separator.as_str())
            .map(|p| Value::Str(p.trim().to_string()))
            .collect()
    }

    /// Una fila por elemento; las demás columnas se repiten. Un texto con un
    /// array JSON se expande en sus elementos.
    pub fn apply(&self, df: &DataFrame) -> Result<DataFrame> {
        let name = require_column(df, &self.column)?;
        let col = df.require(&name)?;

        let mut rows = Vec::with_capacity(df.height());
        let mut exploded = Vec::with_capacity(df.height());
        for (i, cell) in col.values().iter().enumerate() {
            for part in self.parts(cell) {
                rows.push(i);
                exploded.push(part);
            }
        }

        let base = df.take(&rows);
        base.with_column(Column::from_values(name, exploded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn df() -> DataFrame {
        DataFrame::from_records(&[
            json!({"k": "b", "v": 2}),
            json!({"k": "a", "v": null}),
            json!({"k": "b", "v": 1}),
            json!({"k": "c", "v": 3}),
        ])
        .unwrap()
    }

    fn col(df: &DataFrame, name: &str) -> Vec<Value> {
        df.column(name).unwrap().values().to_vec()
    }

    #[test]
    fn sort_descendente_con_nulos_al_final() {
        let s: SortSpec = serde_json::from_value(json!({"sort_cols": "v", "desc": true})).unwrap();
        let out = s.apply(&df(), &mut Vec::new()).unwrap();
        assert_eq!(col(&out, "v"), vec![Value::Int(3), Value::Int(2), Value::Int(1), Value::Null]);
    }

    #[test]
    fn sort_multiple_estable() {
        let s: SortSpec = serde_json::from_value(json!({"sort_cols": ["k", "v"], "descending": [false, true]})).unwrap();
        let out = s.apply(&df(), &mut Vec::new()).unwrap();
        assert_eq!(col(&out, "k"), vec![Value::from("a"), "b".into(), "b".into(), "c".into()]);
        assert_eq!(col(&out, "v")[1], Value::Int(2));
    }

    #[test]
    fn unique_first_y_last() {
        let first: UniqueSpec = serde_json::from_value(json!({"subset": "k"})).unwrap();
        assert_eq!(col(&first.apply(&df()).unwrap(), "v"), vec![Value::Int(2), Value::Null, Value::Int(3)]);

        let last: UniqueSpec = serde_json::from_value(json!({"subset": "k", "keep": "last"})).unwrap();
        assert_eq!(col(&last.apply(&df()).unwrap(), "v"), vec![Value::Null, Value::Int(1), Value::Int(3)]);
    }

    #[test]
    fn limit_con_offset() {
        let l: LimitSpec = serde_json::from_value(json!({"n": "2", "offset": 1})).unwrap();
        assert_eq!(col(&l.apply(&df()), "k"), vec![Value::from("a"), Value::from("b")]);
    }

    #[test]
    fn fill_nulls_estrategias() {
        let v: FillNullsSpec = serde_json::from_value(json!({"strategy": "value", "value": 0})).unwrap();
        assert_eq!(col(&v.apply(&df()).unwrap(), "v")[1], Value::Int(0));

        let f: FillNullsSpec = serde_json::from_value(json!({"strategy": "forward", "columns": "v"})).unwrap();
        assert_eq!(col(&f.apply(&df()).unwrap(), "v")[1], Value::Int(2));

        let b: FillNullsSpec = serde_json::from_value(json!({"strategy": "bfill"})).unwrap();
        assert_eq!(col(&b.apply(&df()).unwrap(), "v")[1], Value::Int(1));

        let sin_valor: FillNullsSpec = serde_json::from_value(json!({"strategy": "value"})).unwrap();
        assert_eq!(sin_valor.validated().unwrap_err().tag(), "ConfigError");
    }

    #[test]
    fn drop_nulls_por_subconjunto() {
        let d: DropNullsSpec = serde_json::from_value(json!({"subset": ["v"]})).unwrap();
        assert_eq!(d.apply(&df()).unwrap().height(), 3);
        let k: DropNullsSpec = serde_json::from_value(json!({"subset": ["k"]})).unwrap();
        assert_eq!(k.apply(&df()).unwrap().height(), 4);
    }

    #[test]
    fn explode_texto_y_array_json() {
        let df = DataFrame::from_records(&[
            json!({"id": 1, "tags": "a, b"}),
            json!({"id": 2, "tags": ["x", "y", "z"]}),
            json!({"id": 3, "tags": null}),
        ])
        .unwrap();
        let e: ExplodeSpec = serde_json::from_value(json!({"column": "tags"})).unwrap();
        let out = e.apply(&df).unwrap();
        assert_eq!(
            col(&out, "id"),
            vec![Value::Int(1), Value::Int(1), Value::Int(2), Value::Int(2), Value::Int(2), Value::Int(3)]
        );
        assert_eq!(col(&out, "tags")[1], Value::from("b"));
        assert_eq!(col(&out, "tags")[4], Value::from("z"));
        assert_eq!(col(&out, "tags")[5], Value::Null);
    }
}
