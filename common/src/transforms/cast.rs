use serde::{Deserialize, Deserializer};

use crate::config::flex;
use crate::error::Result;
use crate::frame::DataFrame;
use crate::transforms::select::require_column;
use crate::value::{check_format, DataType};

pub(crate) fn data_type<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<DataType, D::Error> {
    use serde::de::Error as _;
    let raw = String::deserialize(d)?;
    DataType::parse(&raw).ok_or_else(|| D::Error::custom(format!("tipo '{raw}' desconocido")))
}

#[derive(Debug, Clone, Deserialize)]
pub struct CastOp {
    #[serde(alias = "column")]
    pub col: String,
    #[serde(deserialize_with = "data_type")]
    pub to: DataType,
    #[serde(default, alias = "format", deserialize_with = "flex::opt_string")]
    pub fmt: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CastSpec {
    #[serde(default, deserialize_with = "flex::list_or_json")]
    pub cast_ops: Vec<CastOp>,
}

impl CastSpec {
    pub fn validated(self) -> Result<Self> {
        for op in &self.cast_ops {
            if let Some(fmt) = &op.fmt {
                check_format(fmt)?;
            }
        }
        Ok(self)
    }

    /// Conversión no estricta: lo que no convierte queda en nulo.
    pub fn apply(&self, df: &DataFrame) -> Result<DataFrame> {
        let mut out = df.clone();
        for op in &self.cast_ops {
            let name = require_column(&out, &op.col)?;
            let col = out.require(&name)?.cast(op.to, op.fmt.as_deref());
            out = out.with_column(col)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use serde_json::json;

    fn spec(v: serde_json::Value) -> CastSpec {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn texto_a_entero_no_estricto() {
        let df = DataFrame::from_records(&[json!({"n": "12"}), json!({"n": "doce"})]).unwrap();
        let out = spec(json!({"cast_ops": [{"col": "n", "to": "Int64"}]})).apply(&df).unwrap();
        let c = out.column("n").unwrap();
        assert_eq!(c.dtype(), DataType::Int64);
        assert_eq!(c.values(), &[Value::Int(12), Value::Null]);
    }

    #[test]
    fn fecha_con_formato_ida_y_vuelta() {
        let df = DataFrame::from_records(&[json!({"d": "31/12/2024"}), json!({"d": "no-fecha"})]).unwrap();
        let to_date = spec(json!({"cast_ops": [{"col": "d", "to": "Date", "fmt": "%d/%m/%Y"}]}));
        let back = spec(json!({"cast_ops": [{"col": "d", "to": "Utf8", "fmt": "%d/%m/%Y"}]}));
        let dated = to_date.apply(&df).unwrap();
        assert_eq!(dated.column("d").unwrap().dtype(), DataType::Date);
        let text = back.apply(&dated).unwrap();
        assert_eq!(text.column("d").unwrap().values(), &[Value::from("31/12/2024"), Value::Null]);
    }

    #[test]
    fn formato_invalido_no_aborta() {
        let df = DataFrame::from_records(&[json!({"d": "2024-12-31"})]).unwrap();
        let dated = spec(json!({"cast_ops": [{"col": "d", "to": "Date"}]})).apply(&df).unwrap();
        let bad = spec(json!({"cast_ops": [{"col": "d", "to": "Utf8", "fmt": "%Q"}]}));
        let text = bad.clone().apply(&dated).unwrap();
        assert_eq!(text.column("d").unwrap().values(), &[Value::Null]);
        assert_eq!(bad.validated().unwrap_err().tag(), "ConfigError");
    }

    #[test]
    fn dias_enormes_a_fecha_dan_nulo() {
        let df = DataFrame::from_records(&[json!({"n": 9_000_000_000_000_000_000_i64}), json!({"n": 1})]).unwrap();
        let out = spec(json!({"cast_ops": [{"col": "n", "to": "Date"}]})).apply(&df).unwrap();
        let c = out.column("n").unwrap();
        assert_eq!(c.get(0), &Value::Null);
        assert_eq!(c.get(1), &Value::Date(chrono::NaiveDate::from_ymd_opt(1970, 1, 2).unwrap()));
    }

    #[test]
    fn tipo_desconocido_no_deserializa() {
        let r: std::result::Result<CastSpec, _> =
            serde_json::from_value(json!({"cast_ops": [{"col": "n", "to": "Decimal128"}]}));
        assert!(r.is_err());
    }
}
