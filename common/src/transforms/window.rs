//! Funciones de ventana por partición y agregados móviles.

use serde::Deserialize;

use crate::config::flex;
use crate::error::{EtlError, Result};
use crate::frame::{Column, DataFrame};
use crate::transforms::aggregate::{group_rows, AggFunc};
use crate::transforms::select::require_column;
use crate::value::{DataType, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowFunc {
    RowNumber,
    Rank,
    DenseRank,
    CumSum,
    CumCount,
    Lag,
    Lead,
    Sum,
    #[serde(alias = "avg")]
    Mean,
    Min,
    Max,
    Count,
}

impl WindowFunc {
    fn as_str(self) -> &'static str {
        match self {
            WindowFunc::RowNumber => "row_number",
            WindowFunc::Rank => "rank",
            WindowFunc::DenseRank => "dense_rank",
            WindowFunc::CumSum => "cum_sum",
            WindowFunc::CumCount => "cum_count",
            WindowFunc::Lag => "lag",
            WindowFunc::Lead => "lead",
            WindowFunc::Sum => "sum",
            WindowFunc::Mean => "mean",
            WindowFunc::Min => "min",
            WindowFunc::Max => "max",
            WindowFunc::Count => "count",
        }
    }

    fn needs_column(self) -> bool {
        !matches!(self, WindowFunc::RowNumber | WindowFunc::Rank | WindowFunc::DenseRank)
    }

    fn aggregate(self) -> Option<AggFunc> {
        match self {
            WindowFunc::Sum => Some(AggFunc::Sum),
            WindowFunc::Mean => Some(AggFunc::Avg),
            WindowFunc::Min => Some(AggFunc::Min),
            WindowFunc::Max => Some(AggFunc::Max),
            WindowFunc::Count => Some(AggFunc::Count),
            _ => None,
        }
    }
}

fn default_offset() -> usize {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct WindowSpec {
    pub func: WindowFunc,
    #[serde(default, deserialize_with = "flex::opt_string")]
    pub column: Option<String>,
    #[serde(default, deserialize_with = "flex::string_list")]
    pub partition_by: Vec<String>,
    #[serde(default, deserialize_with = "flex::string_list")]
    pub order_by: Vec<String>,
    #[serde(default, deserialize_with = "flex::bool")]
    pub descending: bool,
    #[serde(default = "default_offset", deserialize_with = "flex::usize")]
    pub offset: usize,
    #[serde(default, rename = "as", alias = "new_col", deserialize_with = "flex::opt_string")]
    pub alias: Option<String>,
}

impl WindowSpec {
    pub fn validated(self) -> Result<Self> {
        if self.func.needs_column() && self.column.is_none() {
            return Err(EtlError::config(format!("window {} requiere 'column'", self.func.as_str())));
        }
        if matches!(self.func, WindowFunc::Rank | WindowFunc::DenseRank) && self.order_by.is_empty() {
            return Err(EtlError::config(format!("window {} requiere 'order_by'", self.func.as_str())));
        }
        Ok(self)
    }

    fn output_name(&self) -> String {
        if let Some(a) = &self.alias {
            return a.clone();
        }
        match &self.column {
            Some(c) if self.func.needs_column() => format!("{c}_{}", self.func.as_str()),
            _ => self.func.as_str().to_string(),
        }
    }

    /// Filas de cada partición en el orden de la ventana.
    fn ordered_partitions(&self, df: &DataFrame) -> Result<(Vec<Vec<usize>>, Vec<String>)> {
        let parts: Vec<String> = self
            .partition_by
            .iter()
            .map(|p| require_column(df, p))
            .collect::<Result<_>>()?;
        let order: Vec<String> = self
            .order_by
            .iter()
            .map(|o| require_column(df, o))
            .collect::<Result<_>>()?;

        let mut groups = if parts.is_empty() {
            vec![(0..df.height()).collect()]
        } else {
            group_rows(df, &parts)?
        };
        if !order.is_empty() {
            let cols: Vec<&Column> = order.iter().map(|o| df.require(o)).collect::<Result<_>>()?;
            for g in &mut groups {
                g.sort_by(|&a, &b| {
                    let ord = cols
                        .iter()
                        .map(|c| c.get(a).total_cmp(c.get(b)))
                        .find(|o| o.is_ne())
                        .unwrap_or(std::cmp::Ordering::Equal);
                    if self.descending {
                        ord.reverse()
                    } else {
                        ord
                    }
                });
            }
        }
        Ok((groups, order))
    }

    pub fn apply(&self, df: &DataFrame) -> Result<DataFrame> {
        let (groups, order) = self.ordered_partitions(df)?;
        let source = match &self.column {
            Some(c) => Some(df.require(&require_column(df, c)?)?.clone()),
            None => None,
        };
        let order_cols: Vec<&Column> = order.iter().map(|o| df.require(o)).collect::<Result<_>>()?;
        let same_order = |a: usize, b: usize| order_cols.iter().all(|c| c.get(a).key() == c.get(b).key());

        let mut out = vec![Value::Null; df.height()];
        let mut out_type = DataType::Int64;

        for g in &groups {
            match self.func {
                WindowFunc::RowNumber => {
                    for (pos, &row) in g.iter().enumerate() {
                        out[row] = Value::Int(pos as i64 + 1);
                    }
                }
                WindowFunc::Rank | WindowFunc::DenseRank => {
                    let mut rank = 0i64;
                    let mut dense = 0i64;
                    for (pos, &row) in g.iter().enumerate() {
                        if pos == 0 || !same_order(g[pos - 1], row) {
                            rank = pos as i64 + 1;
                            dense += 1;
                        }
                        out[row] = Value::Int(if self.func == WindowFunc::Rank { rank } else { dense });
                    }
                }
                WindowFunc::CumCount | WindowFunc::CumSum => {
                    let col = source.as_ref().ok_or_else(|| EtlError::transform("window sin 'column'"))?;
                    if self.func == WindowFunc::CumSum {
                        AggFunc::Sum.check_input(col)?;
                        out_type = AggFunc::Sum.output_type(col.dtype());
                    }
                    let mut count = 0i64;
                    let mut int_sum = 0i64;
                    let mut float_sum = 0.0f64;
                    for &row in g {
                        let v = col.get(row);
                        if v.is_null() {
                            if self.func == WindowFunc::CumCount {
                                out[row] = Value::Int(count);
                            }
                            continue;
                        }
                        count += 1;
                        out[row] = match (self.func, out_type) {
                            (WindowFunc::CumCount, _) => Value::Int(count),
                            (_, DataType::Int64) => {
                                int_sum = int_sum.wrapping_add(v.as_i64().unwrap_or(0));
                                Value::Int(int_sum)
                            }
                            _ => {
                                float_sum += v.as_f64().unwrap_or(0.0);
                                Value::Float(float_sum)
                            }
                        };
                    }
                }
                WindowFunc::Lag | WindowFunc::Lead => {
                    let col = source.as_ref().ok_or_else(|| EtlError::transform("window sin 'column'"))?;
                    out_type = col.dtype();
                    for (pos, &row) in g.iter().enumerate() {
                        let other = match self.func {
                            WindowFunc::Lag => pos.checked_sub(self.offset),
                            _ => pos.checked_add(self.offset).filter(|p| *p < g.len()),
                        };
                        out[row] = other.map(|p| col.get(g[p]).clone()).unwrap_or(Value::Null);
                    }
                }
                func => {
                    let col = source.as_ref().ok_or_else(|| EtlError::transform("window sin 'column'"))?;
                    let agg = func.aggregate().ok_or_else(|| EtlError::transform("función de ventana no soportada"))?;
                    agg.check_input(col)?;
                    out_type = agg.output_type(col.dtype());
                    let v = agg.reduce(g.iter().map(|&r| col.get(r)), col.dtype());
                    for &row in g {
                        out[row] = v.clone();
                    }
                }
            }
        }

        df.with_column(Column::new(self.output_name(), out_type, out))
    }
}

/* =========================
   rolling
   ========================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollingFunc {
    #[serde(alias = "avg")]
    Mean,
    Sum,
    Min,
    Max,
}

impl RollingFunc {
    fn as_str(self) -> &'static str {
        match self {
            RollingFunc::Mean => "mean",
            RollingFunc::Sum => "sum",
            RollingFunc::Min => "min",
            RollingFunc::Max => "max",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RollingSpec {
    pub column: String,
    #[serde(alias = "window_size", deserialize_with = "flex::usize")]
    pub window: usize,
    pub func: RollingFunc,
    #[serde(default, deserialize_with = "flex::opt_usize")]
    pub min_periods: Option<usize>,
    #[serde(default, rename = "as", alias = "new_col", deserialize_with = "flex::opt_string")]
    pub alias: Option<String>,
}

impl RollingSpec {
    pub fn validated(self) -> Result<Self> {
        if self.window == 0 {
            return Err(EtlError::config("rolling: 'window' debe ser mayor que 0"));
        }
        Ok(self)
    }

    /// Ventana de las últimas `window` filas (incluida la actual). Sin
    /// suficientes valores no nulos (`min_periods`, por defecto `window`)
    /// el resultado es nulo.
    pub fn apply(&self, df: &DataFrame) -> Result<DataFrame> {
        let name = require_column(df, &self.column)?;
        let col = df.require(&name)?;
        AggFunc::Sum.check_input(col)?;

        let window = self.window.max(1);
        let min_periods = self.min_periods.unwrap_or(window).max(1);
        let values: Vec<Option<f64>> = col.values().iter().map(Value::as_f64).collect();

        let out = (0..values.len())
            .map(|i| {
                let start = (i + 1).saturating_sub(window);
                let present: Vec<f64> = values[start..=i].iter().flatten().copied().collect();
                if present.len() < min_periods {
                    return Value::Null;
                }
                let v = match self.func {
                    RollingFunc::Sum => present.iter().sum(),
                    RollingFunc::Mean => present.iter().sum::<f64>() / present.len() as f64,
                    RollingFunc::Min => present.iter().copied().fold(f64::INFINITY, f64::min),
                    RollingFunc::Max => present.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                };
                Value::Float(v)
            })
            .collect();

        let out_name = self
            .alias
            .clone()
            .unwrap_or_else(|| format!("{name}_rolling_{}", self.func.as_str()));
        df.with_column(Column::new(out_name, DataType::Float64, out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value as Json};

    fn df() -> DataFrame {
        DataFrame::from_records(&[
            json!({"g": "a", "t": 3, "v": 10}),
            json!({"g": "b", "t": 1, "v": 5}),
            json!({"g": "a", "t": 1, "v": 20}),
            json!({"g": "a", "t": 3, "v": 30}),
        ])
        .unwrap()
    }

    fn window(v: Json) -> WindowSpec {
        serde_json::from_value::<WindowSpec>(v).unwrap().validated().unwrap()
    }

    fn col(df: &DataFrame, name: &str) -> Vec<Value> {
        df.column(name).unwrap().values().to_vec()
    }

    #[test]
    fn row_number_por_particion_y_orden() {
        let w = window(json!({"func": "row_number", "partition_by": "g", "order_by": "t"}));
        let out = w.apply(&df()).unwrap();
        assert_eq!(col(&out, "row_number"), vec![Value::Int(2), Value::Int(1), Value::Int(1), Value::Int(3)]);
    }

    #[test]
    fn rank_y_dense_rank_con_empates() {
        let r = window(json!({"func": "rank", "partition_by": "g", "order_by": "t"}));
        assert_eq!(col(&r.apply(&df()).unwrap(), "rank"), vec![Value::Int(2), Value::Int(1), Value::Int(1), Value::Int(2)]);

        let d = window(json!({"func": "dense_rank", "order_by": "t", "as": "dr"}));
        assert_eq!(col(&d.apply(&df()).unwrap(), "dr"), vec![Value::Int(2), Value::Int(1), Value::Int(1), Value::Int(2)]);
    }

    #[test]
    fn cum_sum_lag_y_agregado_por_particion() {
        let c = window(json!({"func": "cum_sum", "column": "v", "partition_by": "g"}));
        assert_eq!(
            col(&c.apply(&df()).unwrap(), "v_cum_sum"),
            vec![Value::Int(10), Value::Int(5), Value::Int(30), Value::Int(60)]
        );

        let l = window(json!({"func": "lag", "column": "v", "partition_by": "g"}));
        assert_eq!(
            col(&l.apply(&df()).unwrap(), "v_lag"),
            vec![Value::Null, Value::Null, Value::Int(10), Value::Int(20)]
        );

        let s = window(json!({"func": "sum", "column": "v", "partition_by": "g"}));
        assert_eq!(
            col(&s.apply(&df()).unwrap(), "v_sum"),
            vec![Value::Int(60), Value::Int(5), Value::Int(60), Value::Int(60)]
        );
    }

    #[test]
    fn rank_sin_order_by_es_config_error() {
        let w: WindowSpec = serde_json::from_value(json!({"func": "rank"})).unwrap();
        assert_eq!(w.validated().unwrap_err().tag(), "ConfigError");
    }

    #[test]
    fn rolling_media_con_min_periods() {
        let r: RollingSpec = serde_json::from_value(json!({"column": "v", "window": 2, "func": "mean"})).unwrap();
        let out = r.apply(&df()).unwrap();
        assert_eq!(
            col(&out, "v_rolling_mean"),
            vec![Value::Null, Value::Float(7.5), Value::Float(12.5), Value::Float(25.0)]
        );

        let r: RollingSpec =
            serde_json::from_value(json!({"column": "v", "window": 3, "func": "max", "min_periods": 1, "as": "m"})).unwrap();
        assert_eq!(col(&r.apply(&df()).unwrap(), "m")[0], Value::Float(10.0));
    }
}
