use serde::Deserialize;
use serde_json::Value as Json;

use crate::config::flex;
use crate::error::{EtlError, Result};
use crate::frame::{Column, DataFrame};
use crate::transforms::select::{require_column, resolve_column};
use crate::value::{DataType, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MapOpType {
    Add,
    Sub,
    Mul,
    Div,
    Concat,
    Literal,
    Copy,
    Upper,
    Lower,
    Length,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MapOp {
    pub new_col: String,
    pub op_type: MapOpType,
    #[serde(default, deserialize_with = "flex::opt_string")]
    pub a: Option<String>,
    /// Columna o constante.
    #[serde(default, deserialize_with = "flex::opt_string")]
    pub b: Option<String>,
    #[serde(default)]
    pub value: Option<Json>,
    /// Separador para `concat`.
    #[serde(default)]
    pub sep: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MapSpec {
    #[serde(default, deserialize_with = "flex::list_or_json")]
    pub map_ops: Vec<MapOp>,
}

/// Operando: una columna existente o una constante.
enum Operand<'a> {
    Column(&'a Column),
    Const(Value),
}

impl Operand<'_> {
    fn get(&self, i: usize) -> Value {
        match self {
            Operand::Column(c) => c.get(i).clone(),
            Operand::Const(v) => v.clone(),
        }
    }

    fn dtype(&self) -> Option<DataType> {
        match self {
            Operand::Column(c) => Some(c.dtype()),
            Operand::Const(v) => v.data_type(),
        }
    }
}

impl MapOp {
    fn first<'a>(&self, df: &'a DataFrame) -> Result<&'a Column> {
        let a = self
            .a
            .as_deref()
            .ok_or_else(|| EtlError::transform(format!("map '{}': falta la columna 'a'", self.new_col)))?;
        let name = require_column(df, a)?;
        df.require(&name)
    }

    /// `b` nombra una columna si existe; si no, es una constante. Sin `b`,
    /// se usa `value`.
    fn second<'a>(&self, df: &'a DataFrame) -> Result<Operand<'a>> {
        if let Some(b) = self.b.as_deref() {
            if let Some(name) = resolve_column(df, b) {
                return Ok(Operand::Column(df.require(&name)?));
            }
            let constant = b
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .or_else(|_| b.trim().parse::<f64>().map(Value::Float))
                .unwrap_or_else(|_| Value::Str(b.to_string()));
            return Ok(Operand::Const(constant));
        }
        match &self.value {
            Some(v) => Ok(Operand::Const(Value::from_json(v))),
            None => Err(EtlError::transform(format!(
                "map '{}': falta el operando 'b' o 'value'",
                self.new_col
            ))),
        }
    }

    fn compute(&self, df: &DataFrame) -> Result<Column> {
        let n = df.height();
        let name = self.new_col.trim();
        if name.is_empty() {
            return Err(EtlError::transform("map: 'new_col' vacío"));
        }

        let column = match self.op_type {
            MapOpType::Literal => {
                let v = self.value.as_ref().map(Value::from_json).unwrap_or(Value::Null);
                Column::from_values(name, vec![v; n])
            }
            MapOpType::Copy => self.first(df)?.renamed(name),
            MapOpType::Upper | MapOpType::Lower => {
                let a = self.first(df)?;
                let values = a
                    .values()
                    .iter()
                    .map(|v| match v.to_text() {
                        Some(t) if self.op_type == MapOpType::Upper => Value::Str(t.to_uppercase()),
                        Some(t) => Value::Str(t.to_lowercase()),
                        None => Value::Null,
                    })
                    .collect();
                Column::new(name, DataType::Utf8, values)
            }
            MapOpType::Length => {
                let a = self.first(df)?;
                let values = a
                    .values()
                    .iter()
                    .map(|v| v.to_text().map(|t| Value::Int(t.chars().count() as i64)).unwrap_or(Value::Null))
                    .collect();
                Column::new(name, DataType::Int64, values)
            }
            MapOpType::Concat => {
                let a = self.first(df)?;
                let b = self.second(df)?;
                let sep = self.sep.as_deref().unwrap_or("");
                let values = (0..n)
                    .map(|i| {
                        let l = a.get(i).to_text().unwrap_or_default();
                        let r = b.get(i).to_text().unwrap_or_default();
                        Value::Str(format!("{l}{sep}{r}"))
                    })
                    .collect();
                Column::new(name, DataType::Utf8, values)
            }
            MapOpType::Add | MapOpType::Sub | MapOpType::Mul | MapOpType::Div => {
                let a = self.first(df)?;
                let b = self.second(df)?;
                self.arithmetic(name, a, &b, n)?
            }
        };
        Ok(column)
    }

    fn arithmetic(&self, name: &str, a: &Column, b: &Operand<'_>, n: usize) -> Result<Column> {
        let numeric = |t: Option<DataType>| t.map_or(true, |t| t.is_numeric() || t == DataType::Boolean);
        if !numeric(Some(a.dtype())) || !numeric(b.dtype()) {
            return Err(EtlError::transform(format!(
                "map '{}': {:?} requiere operandos numéricos",
                self.new_col, self.op_type
            )));
        }

        let ints = a.dtype().is_integer() && b.dtype().map_or(true, DataType::is_integer);
        let out_type = if ints && self.op_type != MapOpType::Div {
            DataType::Int64
        } else {
            DataType::Float64
        };

        let values = (0..n)
            .map(|i| {
                let (l, r) = (a.get(i), b.get(i));
                if l.is_null() || r.is_null() {
                    return Value::Null;
                }
                if out_type == DataType::Int64 {
                    let (Some(x), Some(y)) = (l.as_i64(), r.as_i64()) else {
                        return Value::Null;
                    };
                    let res = match self.op_type {
                        MapOpType::Add => x.checked_add(y),
                        MapOpType::Sub => x.checked_sub(y),
                        _ => x.checked_mul(y),
                    };
                    return res.map(Value::Int).unwrap_or(Value::Null);
                }
                let (Some(x), Some(y)) = (l.as_f64(), r.as_f64()) else {
                    return Value::Null;
                };
                match self.op_type {
                    MapOpType::Add => Value::Float(x + y),
                    MapOpType::Sub => Value::Float(x - y),
                    MapOpType::Mul => Value::Float(x * y),
                    _ if y == 0.0 => Value::Null,
                    _ => Value::Float(x / y),
                }
            })
            .collect();
        Ok(Column::new(name, out_type, values))
    }
}

impl MapSpec {
    /// Las operaciones se aplican en orden; cada una ve las columnas que
    /// crearon las anteriores.
    pub fn apply(&self, df: &DataFrame, warnings: &mut Vec<String>) -> Result<DataFrame> {
        if self.map_ops.is_empty() {
            warnings.push("map sin operaciones".to_string());
            return Ok(df.clone());
        }
        let mut out = df.clone();
        for op in &self.map_ops {
            let col = op.compute(&out)?;
            out = out.with_column(col)?;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(v: Json) -> MapSpec {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn literal_y_upper() {
        let df = DataFrame::from_records(&[json!({"name": "ann"})]).unwrap();
        let s = spec(json!({"map_ops": [
            {"new_col": "N", "op_type": "upper", "a": "name"},
            {"new_col": "tag", "op_type": "literal", "value": "x"}
        ]}));
        let out = s.apply(&df, &mut Vec::new()).unwrap();
        assert_eq!(out.to_records(), vec![json!({"name": "ann", "N": "ANN", "tag": "x"})]);
    }

    #[test]
    fn aritmetica_y_division_por_cero() {
        let df = DataFrame::from_records(&[json!({"a": 6, "b": 3}), json!({"a": 1, "b": 0})]).unwrap();
        let s = spec(json!({"map_ops": [
            {"new_col": "s", "op_type": "add", "a": "a", "b": "b"},
            {"new_col": "d", "op_type": "div", "a": "a", "b": "b"},
            {"new_col": "m", "op_type": "mul", "a": "a", "b": "2.5"}
        ]}));
        let out = s.apply(&df, &mut Vec::new()).unwrap();
        assert_eq!(out.column("s").unwrap().values(), &[Value::Int(9), Value::Int(1)]);
        assert_eq!(out.column("d").unwrap().values(), &[Value::Float(2.0), Value::Null]);
        assert_eq!(out.column("m").unwrap().values(), &[Value::Float(15.0), Value::Float(2.5)]);
    }

    #[test]
    fn concat_trata_nulos_como_vacio() {
        let df = DataFrame::from_records(&[json!({"a": "x", "b": null}), json!({"a": 1, "b": "y"})]).unwrap();
        let s = spec(json!({"map_ops": [{"new_col": "c", "op_type": "concat", "a": "a", "b": "b", "sep": "-"}]}));
        let out = s.apply(&df, &mut Vec::new()).unwrap();
        assert_eq!(out.column("c").unwrap().values(), &[Value::from("x-"), Value::from("1-y")]);
    }

    #[test]
    fn operaciones_encadenadas_y_length() {
        let df = DataFrame::from_records(&[json!({"name": "Ñandú"})]).unwrap();
        let s = spec(json!({"map_ops": [
            {"new_col": "c", "op_type": "copy", "a": "name"},
            {"new_col": "len", "op_type": "length", "a": "c"}
        ]}));
        let out = s.apply(&df, &mut Vec::new()).unwrap();
        assert_eq!(out.column("len").unwrap().get(0), &Value::Int(5));
    }

    #[test]
    fn aritmetica_sobre_texto_falla() {
        let df = DataFrame::from_records(&[json!({"a": "x"})]).unwrap();
        let s = spec(json!({"map_ops": [{"new_col": "z", "op_type": "add", "a": "a", "value": 1}]}));
        assert_eq!(s.apply(&df, &mut Vec::new()).unwrap_err().tag(), "TransformError");
    }
}
