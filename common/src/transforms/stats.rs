use serde::Deserialize;

use crate::config::flex;
use crate::error::{EtlError, Result};
use crate::frame::{Column, DataFrame};
use crate::transforms::select::require_column;
use crate::value::{DataType, Value};

/* =========================
   binning
   ========================= */

#[derive(Debug, Clone, Deserialize)]
pub struct BinningSpec {
    pub column: String,
    /// Bordes explícitos, crecientes.
    #[serde(default, deserialize_with = "flex::f64_list")]
    pub edges: Vec<f64>,
    /// Sin `edges`: número de intervalos de igual ancho entre mínimo y máximo.
    #[serde(default, deserialize_with = "flex::opt_usize")]
    pub bins: Option<usize>,
    #[serde(default, deserialize_with = "flex::string_list")]
    pub labels: Vec<String>,
    #[serde(default, deserialize_with = "flex::opt_string")]
    pub new_col: Option<String>,
}

impl BinningSpec {
    pub fn validated(self) -> Result<Self> {
        let intervals = if self.edges.is_empty() {
            match self.bins {
                Some(n) if n > 0 => n,
                _ => return Err(EtlError::config("binning requiere 'edges' o 'bins' > 0")),
            }
        } else {
            if self.edges.len() < 2 {
                return Err(EtlError::config("binning: 'edges' necesita al menos dos bordes"));
            }
            if self.edges.windows(2).any(|w| w[0] >= w[1]) {
                return Err(EtlError::config("binning: 'edges' debe ser estrictamente creciente"));
            }
            self.edges.len() - 1
        };
        if !self.labels.is_empty() && self.labels.len() != intervals {
            return Err(EtlError::config(format!(
                "binning: {} etiquetas para {intervals} intervalos",
                self.labels.len()
            )));
        }
        Ok(self)
    }

    fn resolve_edges(&self, values: &[f64]) -> Vec<f64> {
        if !self.edges.is_empty() {
            return self.edges.clone();
        }
        let n = self.bins.unwrap_or(1).max(1);
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if !min.is_finite() || !max.is_finite() {
            return Vec::new();
        }
        let width = if max > min { (max - min) / n as f64 } else { 1.0 };
        (0..=n).map(|i| min + width * i as f64).collect()
    }

    /// Intervalos cerrados por la derecha; el primero incluye su borde
    /// inferior. Fuera de rango o nulo queda en nulo.
    pub fn apply(&self, df: &DataFrame) -> Result<DataFrame> {
        let name = require_column(df, &self.column)?;
        let col = df.require(&name)?;
        let nums: Vec<Option<f64>> = col.values().iter().map(Value::as_f64).collect();
        let present: Vec<f64> = nums.iter().flatten().copied().collect();
        let edges = self.resolve_edges(&present);

        let labels: Vec<String> = if self.labels.is_empty() {
            edges.windows(2).map(|w| format!("({}, {}]", w[0], w[1])).collect()
        } else {
            self.labels.clone()
        };

        let values = nums
            .iter()
            .map(|n| {
                let Some(x) = n else { return Value::Null };
                let slot = edges
                    .windows(2)
                    .position(|w| (x > &w[0] || (x == &edges[0] && w[0] == edges[0])) && x <= &w[1]);
                slot.and_then(|i| labels.get(i))
                    .map(|l| Value::Str(l.clone()))
                    .unwrap_or(Value::Null)
            })
            .collect();

        let out_name = self.new_col.clone().unwrap_or_else(|| format!("{name}_bin"));
        df.with_column(Column::new(out_name, DataType::Utf8, values))
    }
}

/* =========================
   outliers
   ========================= */

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutlierMethod {
    #[default]
    Iqr,
    Zscore,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutlierAction {
    #[default]
    Flag,
    Drop,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutliersSpec {
    pub column: String,
    #[serde(default)]
    pub method: OutlierMethod,
    /// 1.5 para iqr, 3.0 para zscore.
    #[serde(default, deserialize_with = "flex::opt_f64")]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub action: OutlierAction,
    #[serde(default, deserialize_with = "flex::opt_string")]
    pub flag_col: Option<String>,
}

/// Cuantil con interpolación lineal sobre valores ordenados.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return f64::NAN;
    }
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

impl OutliersSpec {
    /// Límites [bajo, alto] fuera de los cuales un valor es atípico.
    fn bounds(&self, values: &[f64]) -> Option<(f64, f64)> {
        if values.is_empty() {
            return None;
        }
        match self.method {
            OutlierMethod::Iqr => {
                let k = self.threshold.unwrap_or(1.5);
                let mut sorted = values.to_vec();
                sorted.sort_by(f64::total_cmp);
                let q1 = quantile(&sorted, 0.25);
                let q3 = quantile(&sorted, 0.75);
                let iqr = q3 - q1;
                Some((q1 - k * iqr, q3 + k * iqr))
            }
            OutlierMethod::Zscore => {
                let k = self.threshold.unwrap_or(3.0);
                let n = values.len() as f64;
                let mean = values.iter().sum::<f64>() / n;
                let std = (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt();
                if std == 0.0 {
                    return None;
                }
                Some((mean - k * std, mean + k * std))
            }
        }
    }

    pub fn apply(&self, df: &DataFrame) -> Result<DataFrame> {
        let name = require_column(df, &self.column)?;
        let col = df.require(&name)?;
        if !col.dtype().is_numeric() && col.values().iter().any(|v| !v.is_null() && v.as_f64().is_none()) {
            return Err(EtlError::transform(format!("outliers: la columna '{name}' no es numérica")));
        }
        let nums: Vec<Option<f64>> = col.values().iter().map(Value::as_f64).collect();
        let present: Vec<f64> = nums.iter().flatten().copied().collect();
        let bounds = self.bounds(&present);

        // nulo nunca es atípico
        let flags: Vec<bool> = nums
            .iter()
            .map(|n| match (n, bounds) {
                (Some(x), Some((lo, hi))) => *x < lo || *x > hi,
                _ => false,
            })
            .collect();

        match self.action {
            OutlierAction::Drop => {
                let keep: Vec<bool> = flags.iter().map(|f| !f).collect();
                Ok(df.filter(&keep))
            }
            OutlierAction::Flag => {
                let out_name = self.flag_col.clone().unwrap_or_else(|| format!("{name}_outlier"));
                let values = flags.into_iter().map(Value::Bool).collect();
                df.with_column(Column::new(out_name, DataType::Boolean, values))
            }
        }
    }
}
