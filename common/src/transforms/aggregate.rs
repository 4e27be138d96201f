use std::collections::{HashMap, HashSet};

use serde::Deserialize;

use crate::config::flex;
use crate::error::{EtlError, Result};
use crate::frame::{Column, DataFrame};
use crate::transforms::select::require_column;
use crate::value::{DataType, KeyValue, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggFunc {
    Sum,
    #[serde(alias = "mean")]
    Avg,
    Min,
    Max,
    Count,
    First,
    Last,
    #[serde(alias = "nunique")]
    CountDistinct,
}

impl AggFunc {
    pub fn as_str(self) -> &'static str {
        match self {
            AggFunc::Sum => "sum",
            AggFunc::Avg => "avg",
            AggFunc::Min => "min",
            AggFunc::Max => "max",
            AggFunc::Count => "count",
            AggFunc::First => "first",
            AggFunc::Last => "last",
            AggFunc::CountDistinct => "count_distinct",
        }
    }

    /// Tipo del resultado para una columna de entrada `input`.
    pub fn output_type(self, input: DataType) -> DataType {
        match self {
            AggFunc::Sum if input.is_integer() || input == DataType::Boolean => DataType::Int64,
            AggFunc::Sum | AggFunc::Avg => DataType::Float64,
            AggFunc::Count | AggFunc::CountDistinct => DataType::Int64,
            AggFunc::Min | AggFunc::Max | AggFunc::First | AggFunc::Last => input,
        }
    }

    pub fn check_input(self, col: &Column) -> Result<()> {
        let numeric = col.dtype().is_numeric() || col.dtype() == DataType::Boolean;
        if matches!(self, AggFunc::Sum | AggFunc::Avg) && !numeric {
            return Err(EtlError::transform(format!(
                "{} requiere una columna numérica, '{}' es {}",
                self.as_str(),
                col.name(),
                col.dtype()
            )));
        }
        Ok(())
    }

    /// Reduce un grupo de celdas. Los nulos se ignoran; `first`/`last`
    /// toman el primer/último valor no nulo.
    pub fn reduce<'a>(self, values: impl IntoIterator<Item = &'a Value>, input: DataType) -> Value {
        let present: Vec<&Value> = values.into_iter().filter(|v| !v.is_null()).collect();
        match self {
            AggFunc::Count => Value::Int(present.len() as i64),
            AggFunc::CountDistinct => {
                Value::Int(present.iter().map(|v| v.key()).collect::<HashSet<_>>().len() as i64)
            }
            AggFunc::First => present.first().map(|v| (*v).clone()).unwrap_or(Value::Null),
            AggFunc::Last => present.last().map(|v| (*v).clone()).unwrap_or(Value::Null),
            AggFunc::Min => present
                .iter()
                .min_by(|a, b| a.total_cmp(b))
                .map(|v| (*v).clone())
                .unwrap_or(Value::Null),
            AggFunc::Max => present
                .iter()
                .max_by(|a, b| a.total_cmp(b))
                .map(|v| (*v).clone())
                .unwrap_or(Value::Null),
            AggFunc::Sum if self.output_type(input) == DataType::Int64 => {
                Value::Int(present.iter().filter_map(|v| v.as_i64()).fold(0i64, i64::wrapping_add))
            }
            AggFunc::Sum => Value::Float(present.iter().filter_map(|v| v.as_f64()).sum()),
            AggFunc::Avg => {
                let nums: Vec<f64> = present.iter().filter_map(|v| v.as_f64()).collect();
                if nums.is_empty() {
                    Value::Null
                } else {
                    Value::Float(nums.iter().sum::<f64>() / nums.len() as f64)
                }
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggSpec {
    #[serde(alias = "column")]
    pub col: String,
    pub func: AggFunc,
    #[serde(default, rename = "as", alias = "alias", deserialize_with = "flex::opt_string")]
    pub alias: Option<String>,
}

impl AggSpec {
    pub fn output_name(&self) -> String {
        self.alias
            .clone()
            .unwrap_or_else(|| format!("{}_{}", self.col, self.func.as_str()))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AggregateSpec {
    #[serde(default, alias = "group_by", deserialize_with = "flex::string_list")]
    pub group_by_list: Vec<String>,
    #[serde(default, deserialize_with = "flex::list_or_json")]
    pub aggs: Vec<AggSpec>,
}

/// Agrupa filas por clave conservando el orden de primera aparición.
/// Los nulos forman su propio grupo.
pub fn group_rows(df: &DataFrame, keys: &[String]) -> Result<Vec<Vec<usize>>> {
    let cols = keys.iter().map(|k| df.require(k)).collect::<Result<Vec<_>>>()?;
    let mut slot: HashMap<Vec<KeyValue>, usize> = HashMap::new();
    let mut groups: Vec<Vec<usize>> = Vec::new();
    for i in 0..df.height() {
        let key: Vec<KeyValue> = cols.iter().map(|c| c.get(i).key()).collect();
        match slot.get(&key) {
            Some(&g) => groups[g].push(i),
            None => {
                slot.insert(key, groups.len());
                groups.push(vec![i]);
            }
        }
    }
    Ok(groups)
}

impl AggregateSpec {
    pub fn apply(&self, df: &DataFrame, warnings: &mut Vec<String>) -> Result<DataFrame> {
        if self.group_by_list.is_empty() && self.aggs.is_empty() {
            warnings.push("aggregate sin group_by_list ni aggs: no se agrega nada".to_string());
            return Ok(df.clone());
        }
        if self.aggs.is_empty() {
            warnings.push("aggregate sin aggs: sólo se listan los grupos".to_string());
        }

        let keys = self
            .group_by_list
            .iter()
            .map(|k| require_column(df, k))
            .collect::<Result<Vec<_>>>()?;

        let groups = if keys.is_empty() {
            // sin claves: una única fila aunque la entrada esté vacía
            vec![(0..df.height()).collect::<Vec<_>>()]
        } else {
            group_rows(df, &keys)?
        };

        let mut columns = Vec::with_capacity(keys.len() + self.aggs.len());
        for k in &keys {
            let col = df.require(k)?;
            let firsts: Vec<usize> = groups.iter().filter_map(|g| g.first().copied()).collect();
            columns.push(col.take(&firsts));
        }

        for agg in &self.aggs {
            let name = require_column(df, &agg.col)?;
            let col = df.require(&name)?;
            agg.func.check_input(col)?;
            let values = groups
                .iter()
                .map(|g| agg.func.reduce(g.iter().map(|&i| col.get(i)), col.dtype()))
                .collect();
            let out_name = agg.output_name();
            if columns.iter().any(|c: &Column| c.name() == out_name) {
                return Err(EtlError::RenameCollision(out_name));
            }
            columns.push(Column::new(out_name, agg.func.output_type(col.dtype()), values));
        }

        DataFrame::new(columns)
    }
}
