use serde::Deserialize;
use serde_json::Value as Json;

use crate::config::flex;
use crate::error::Result;
use crate::frame::{Column, DataFrame};
use crate::transforms::select::require_column;
use crate::value::{parse_date, parse_datetime, DataType, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    /// Todas las reglas (AND).
    #[default]
    All,
    /// Alguna regla (OR).
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum FilterOp {
    #[serde(rename = ">", alias = "gt")]
    Gt,
    #[serde(rename = "<", alias = "lt")]
    Lt,
    #[serde(rename = "==", alias = "=", alias = "eq")]
    Eq,
    #[serde(rename = "!=", alias = "<>", alias = "ne")]
    Ne,
    #[serde(rename = ">=", alias = "ge")]
    Ge,
    #[serde(rename = "<=", alias = "le")]
    Le,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "isnull", alias = "is_null")]
    IsNull,
    #[serde(rename = "notnull", alias = "not_null")]
    NotNull,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilterRule {
    pub column: String,
    pub op: FilterOp,
    #[serde(default)]
    pub value: Json,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterSpec {
    #[serde(default)]
    pub filter_mode: FilterMode,
    #[serde(default, deserialize_with = "flex::list_or_json")]
    pub filter_rules: Vec<FilterRule>,
}

impl FilterSpec {
    pub fn apply(&self, df: &DataFrame, warnings: &mut Vec<String>) -> Result<DataFrame> {
        if self.filter_rules.is_empty() {
            warnings.push("filter sin reglas: no se filtra nada".to_string());
            return Ok(df.clone());
        }

        let mut masks = Vec::with_capacity(self.filter_rules.len());
        for rule in &self.filter_rules {
            let name = require_column(df, &rule.column)?;
            let col = df.require(&name)?;
            masks.push(rule_mask(col, rule));
        }

        let keep: Vec<bool> = (0..df.height())
            .map(|i| match self.filter_mode {
                FilterMode::All => masks.iter().all(|m| m[i]),
                FilterMode::Any => masks.iter().any(|m| m[i]),
            })
            .collect();
        Ok(df.filter(&keep))
    }
}

/// Valor derecho ya interpretado según el tipo de la columna.
enum Rhs {
    Number(f64),
    Bool(bool),
    Temporal(Value),
    Text(String),
}

fn json_text(v: &Json) -> String {
    match v {
        Json::Null => String::new(),
        Json::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn rhs_for(dtype: DataType, raw: &Json) -> Rhs {
    let text = json_text(raw);
    match dtype {
        t if t.is_numeric() => match raw.as_f64().or_else(|| text.trim().parse().ok()) {
            Some(f) => Rhs::Number(f),
            None => Rhs::Text(text),
        },
        DataType::Boolean => match raw.as_bool().or_else(|| crate::value::parse_bool(&text)) {
            Some(b) => Rhs::Bool(b),
            None => Rhs::Text(text),
        },
        DataType::Date => match parse_date(&text, None) {
            Some(d) => Rhs::Temporal(Value::Date(d)),
            None => Rhs::Text(text),
        },
        DataType::Datetime => match parse_datetime(&text, None) {
            Some(dt) => Rhs::Temporal(Value::Datetime(dt)),
            None => Rhs::Text(text),
        },
        _ => Rhs::Text(text),
    }
}

fn compare(cell: &Value, rhs: &Rhs) -> Option<std::cmp::Ordering> {
    match rhs {
        Rhs::Number(r) => cell.as_f64().and_then(|l| l.partial_cmp(r)),
        Rhs::Bool(r) => match cell {
            Value::Bool(l) => Some(l.cmp(r)),
            _ => None,
        },
        Rhs::Temporal(r) => Some(cell.total_cmp(r)),
        Rhs::Text(r) => cell.to_text().map(|l| l.as_str().cmp(r.as_str())),
    }
}

fn in_list(raw: &Json) -> Vec<Json> {
    match raw {
        Json::Array(items) => items.clone(),
        other => flex::list_from_value(other).into_iter().map(Json::String).collect(),
    }
}

/// Las celdas nulas sólo cumplen `isnull`.
fn rule_mask(col: &Column, rule: &FilterRule) -> Vec<bool> {
    use std::cmp::Ordering::*;

    let dtype = col.dtype();
    let rhs = rhs_for(dtype, &rule.value);
    let needle = json_text(&rule.value);
    let options: Vec<Rhs> = match rule.op {
        FilterOp::In => in_list(&rule.value).iter().map(|v| rhs_for(dtype, v)).collect(),
        _ => Vec::new(),
    };

    col.values()
        .iter()
        .map(|cell| {
            if cell.is_null() {
                return rule.op == FilterOp::IsNull;
            }
            match rule.op {
                FilterOp::IsNull => false,
                FilterOp::NotNull => true,
                FilterOp::Contains => cell.to_text().is_some_and(|t| t.contains(needle.as_str())),
                FilterOp::In => options.iter().any(|o| compare(cell, o) == Some(Equal)),
                FilterOp::Eq => compare(cell, &rhs) == Some(Equal),
                FilterOp::Ne => compare(cell, &rhs).is_some_and(|o| o != Equal),
                FilterOp::Gt => compare(cell, &rhs) == Some(Greater),
                FilterOp::Lt => compare(cell, &rhs) == Some(Less),
                FilterOp::Ge => matches!(compare(cell, &rhs), Some(Greater | Equal)),
                FilterOp::Le => matches!(compare(cell, &rhs), Some(Less | Equal)),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn df() -> DataFrame {
        DataFrame::from_records(&[
            json!({"a": 1, "s": "rojo", "b": true}),
            json!({"a": 3, "s": "verde", "b": false}),
            json!({"a": 5, "s": null, "b": true}),
        ])
        .unwrap()
    }

    fn spec(v: Json) -> FilterSpec {
        serde_json::from_value(v).unwrap()
    }

    fn col_a(df: &DataFrame) -> Vec<Value> {
        df.column("a").unwrap().values().to_vec()
    }

    #[test]
    fn filtra_numerico_con_valor_texto() {
        let s = spec(json!({"filter_rules": [{"column": "a", "op": ">", "value": "2"}]}));
        let out = s.apply(&df(), &mut Vec::new()).unwrap();
        assert_eq!(col_a(&out), vec![Value::Int(3), Value::Int(5)]);
    }

    #[test]
    fn modo_any_y_all() {
        let rules = json!([
            {"column": "a", "op": "==", "value": 1},
            {"column": "s", "op": "contains", "value": "erd"}
        ]);
        let all = spec(json!({"filter_mode": "all", "filter_rules": rules.clone()}));
        let any = spec(json!({"filter_mode": "any", "filter_rules": rules}));
        assert_eq!(all.apply(&df(), &mut Vec::new()).unwrap().height(), 0);
        assert_eq!(col_a(&any.apply(&df(), &mut Vec::new()).unwrap()), vec![Value::Int(1), Value::Int(3)]);
    }

    #[test]
    fn in_acepta_lista_o_texto() {
        let a = spec(json!({"filter_rules": [{"column": "a", "op": "in", "value": [1, 5]}]}));
        let b = spec(json!({"filter_rules": [{"column": "a", "op": "in", "value": "1, 5"}]}));
        assert_eq!(col_a(&a.apply(&df(), &mut Vec::new()).unwrap()), vec![Value::Int(1), Value::Int(5)]);
        assert_eq!(col_a(&b.apply(&df(), &mut Vec::new()).unwrap()), vec![Value::Int(1), Value::Int(5)]);
    }

    #[test]
    fn nulos_solo_cumplen_isnull() {
        let isnull = spec(json!({"filter_rules": [{"column": "s", "op": "isnull"}]}));
        let ne = spec(json!({"filter_rules": [{"column": "s", "op": "!=", "value": "rojo"}]}));
        assert_eq!(col_a(&isnull.apply(&df(), &mut Vec::new()).unwrap()), vec![Value::Int(5)]);
        assert_eq!(col_a(&ne.apply(&df(), &mut Vec::new()).unwrap()), vec![Value::Int(3)]);
    }

    #[test]
    fn booleanos() {
        let s = spec(json!({"filter_rules": [{"column": "b", "op": "==", "value": "true"}]}));
        assert_eq!(s.apply(&df(), &mut Vec::new()).unwrap().height(), 2);
    }

    #[test]
    fn reglas_vacias_son_noop_con_aviso() {
        let mut warnings = Vec::new();
        let out = FilterSpec::default().apply(&df(), &mut warnings).unwrap();
        assert_eq!(out, df());
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn columna_desconocida_falla() {
        let s = spec(json!({"filter_rules": [{"column": "zz", "op": "notnull"}]}));
        assert_eq!(s.apply(&df(), &mut Vec::new()).unwrap_err().tag(), "TransformError");
    }

    #[test]
    fn operador_desconocido_no_deserializa() {
        let r: std::result::Result<FilterSpec, _> =
            serde_json::from_value(json!({"filter_rules": [{"column": "a", "op": "~", "value": 1}]}));
        assert!(r.is_err());
    }
}
