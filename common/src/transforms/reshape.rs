use std::collections::HashMap;

use serde::Deserialize;

use crate::config::flex;
use crate::error::{EtlError, Result};
use crate::frame::{Column, DataFrame};
use crate::transforms::aggregate::{group_rows, AggFunc};
use crate::transforms::select::require_column;
use crate::value::{KeyValue, Value};

fn default_pivot_agg() -> AggFunc {
    AggFunc::First
}

#[derive(Debug, Clone, Deserialize)]
pub struct PivotSpec {
    #[serde(deserialize_with = "flex::string_list")]
    pub index: Vec<String>,
    pub columns: String,
    pub values: String,
    #[serde(default = "default_pivot_agg", alias = "aggregate_function")]
    pub agg: AggFunc,
}

impl PivotSpec {
    /// Una fila por combinación de `index` (orden de aparición) y una
    /// columna por valor distinto de `columns`. Celdas sin datos quedan nulas.
    pub fn apply(&self, df: &DataFrame) -> Result<DataFrame> {
        let index: Vec<String> = self
            .index
            .iter()
            .map(|i| require_column(df, i))
            .collect::<Result<_>>()?;
        let pivot_col = df.require(&require_column(df, &self.columns)?)?;
        let value_col = df.require(&require_column(df, &self.values)?)?;
        self.agg.check_input(value_col)?;

        let groups = if index.is_empty() {
            vec![(0..df.height()).collect::<Vec<_>>()]
        } else {
            group_rows(df, &index)?
        };

        // valores distintos de la columna pivote, en orden de aparición
        let mut headers: Vec<String> = Vec::new();
        let mut slot: HashMap<KeyValue, usize> = HashMap::new();
        for v in pivot_col.values() {
            let k = v.key();
            if !slot.contains_key(&k) {
                slot.insert(k, headers.len());
                headers.push(v.to_text().unwrap_or_else(|| "null".to_string()));
            }
        }

        let mut columns: Vec<Column> = Vec::with_capacity(index.len() + headers.len());
        let firsts: Vec<usize> = groups.iter().filter_map(|g| g.first().copied()).collect();
        for name in &index {
            columns.push(df.require(name)?.take(&firsts));
        }

        let out_type = self.agg.output_type(value_col.dtype());
        for (h, label) in headers.iter().enumerate() {
            if columns.iter().any(|c| c.name() == label) {
                return Err(EtlError::RenameCollision(label.clone()));
            }
            let cells = groups
                .iter()
                .map(|g| {
                    let hits: Vec<&Value> = g
                        .iter()
                        .filter(|&&r| slot.get(&pivot_col.get(r).key()) == Some(&h))
                        .map(|&r| value_col.get(r))
                        .collect();
                    if hits.is_empty() {
                        Value::Null
                    } else {
                        self.agg.reduce(hits, value_col.dtype())
                    }
                })
                .collect();
            columns.push(Column::new(label.clone(), out_type, cells));
        }

        DataFrame::new(columns)
    }
}

fn default_var_name() -> String {
    "variable".to_string()
}

fn default_value_name() -> String {
    "value".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnpivotSpec {
    #[serde(default, deserialize_with = "flex::string_list")]
    pub id_vars: Vec<String>,
    #[serde(default, deserialize_with = "flex::string_list")]
    pub value_vars: Vec<String>,
    #[serde(default = "default_var_name")]
    pub var_name: String,
    #[serde(default = "default_value_name")]
    pub value_name: String,
}

impl UnpivotSpec {
    /// Formato largo: por cada columna de `value_vars` (por defecto, todas
    /// las que no son `id_vars`) se repiten todas las filas.
    pub fn apply(&self, df: &DataFrame) -> Result<DataFrame> {
        let ids: Vec<String> = self
            .id_vars
            .iter()
            .map(|i| require_column(df, i))
            .collect::<Result<_>>()?;
        let vars: Vec<String> = if self.value_vars.is_empty() {
            df.column_names().into_iter().filter(|n| !ids.contains(n)).collect()
        } else {
            self.value_vars
                .iter()
                .map(|v| require_column(df, v))
                .collect::<Result<_>>()?
        };
        if ids.contains(&self.var_name) || ids.contains(&self.value_name) || self.var_name == self.value_name {
            return Err(EtlError::RenameCollision(self.var_name.clone()));
        }

        let n = df.height();
        let rows: Vec<usize> = (0..vars.len()).flat_map(|_| 0..n).collect();
        let mut columns: Vec<Column> = ids
            .iter()
            .map(|i| df.require(i).map(|c| c.take(&rows)))
            .collect::<Result<_>>()?;

        let labels: Vec<Value> = vars
            .iter()
            .flat_map(|v| std::iter::repeat(Value::Str(v.clone())).take(n))
            .collect();
        let mut values: Vec<Value> = Vec::with_capacity(vars.len() * n);
        for v in &vars {
            values.extend(df.require(v)?.values().iter().cloned());
        }
        columns.push(Column::from_values(self.var_name.clone(), labels));
        columns.push(Column::from_values(self.value_name.clone(), values));
        DataFrame::new(columns)
    }
}
