//! DataFrame columnar inmutable.
//!
//! Cada operación devuelve un DataFrame nuevo; nada se modifica en sitio.
//! Las columnas guardan sus celdas como `Value` y llevan el tipo declarado.

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value as Json};

use crate::error::{EtlError, Result};
use crate::value::{cast_value, unify_types, DataType, Value};

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    name: String,
    dtype: DataType,
    values: Vec<Value>,
}

impl Column {
    /// Construye una columna con tipo explícito. Las celdas que no encajan
    /// con el tipo se convierten con las reglas de `cast_value`.
    pub fn new(name: impl Into<String>, dtype: DataType, values: Vec<Value>) -> Self {
        let values = values
            .into_iter()
            .map(|v| if fits(&v, dtype) { v } else { cast_value(&v, dtype, None) })
            .collect();
        Self {
            name: name.into(),
            dtype,
            values,
        }
    }

    /// Construye una columna infiriendo el tipo a partir de las celdas.
    pub fn from_values(name: impl Into<String>, values: Vec<Value>) -> Self {
        let dtype = infer_type(&values);
        Self::new(name, dtype, values)
    }

    pub fn nulls(name: impl Into<String>, dtype: DataType, len: usize) -> Self {
        Self {
            name: name.into(),
            dtype,
            values: vec![Value::Null; len],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, row: usize) -> &Value {
        self.values.get(row).unwrap_or(&Value::Null)
    }

    pub fn null_count(&self) -> usize {
        self.values.iter().filter(|v| v.is_null()).count()
    }

    pub fn renamed(&self, name: impl Into<String>) -> Column {
        Column {
            name: name.into(),
            dtype: self.dtype,
            values: self.values.clone(),
        }
    }

    pub fn take(&self, rows: &[usize]) -> Column {
        Column {
            name: self.name.clone(),
            dtype: self.dtype,
            values: rows.iter().map(|&i| self.get(i).clone()).collect(),
        }
    }

    /// Como `take`, pero `None` produce un nulo (lado sin pareja en un join).
    pub fn take_opt(&self, rows: &[Option<usize>]) -> Column {
        Column {
            name: self.name.clone(),
            dtype: self.dtype,
            values: rows
                .iter()
                .map(|r| r.map(|i| self.get(i).clone()).unwrap_or(Value::Null))
                .collect(),
        }
    }

    pub fn cast(&self, to: DataType, fmt: Option<&str>) -> Column {
        Column {
            name: self.name.clone(),
            dtype: to,
            values: self.values.iter().map(|v| cast_value(v, to, fmt)).collect(),
        }
    }

    /// Número de valores distintos no nulos.
    pub fn n_unique(&self) -> usize {
        self.values
            .iter()
            .filter(|v| !v.is_null())
            .map(Value::key)
            .collect::<HashSet<_>>()
            .len()
    }
}

fn fits(v: &Value, dtype: DataType) -> bool {
    match (v, dtype) {
        (Value::Null, _) => true,
        (Value::Int(_), t) => t.is_integer(),
        (Value::Float(_), t) => t.is_float(),
        (Value::Str(_), DataType::Utf8) => true,
        (Value::Bool(_), DataType::Boolean) => true,
        (Value::Date(_), DataType::Date) => true,
        (Value::Datetime(_), DataType::Datetime) => true,
        _ => false,
    }
}

/// Tipo común de una secuencia de celdas; columnas todo-nulo quedan en Utf8.
pub fn infer_type(values: &[Value]) -> DataType {
    values
        .iter()
        .filter_map(Value::data_type)
        .reduce(unify_types)
        .unwrap_or(DataType::Utf8)
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataFrame {
    columns: Vec<Column>,
    height: usize,
}

impl DataFrame {
    /// Valida que las columnas tengan el mismo largo y nombres únicos.
    pub fn new(columns: Vec<Column>) -> Result<Self> {
        let height = columns.first().map(Column::len).unwrap_or(0);
        let mut seen = HashSet::new();
        for c in &columns {
            if c.len() != height {
                return Err(EtlError::transform(format!(
                    "la columna '{}' tiene {} filas, se esperaban {height}",
                    c.name,
                    c.len()
                )));
            }
            if !seen.insert(c.name.as_str()) {
                return Err(EtlError::transform(format!("columna duplicada '{}'", c.name)));
            }
        }
        Ok(Self { columns, height })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Construye por filas, infiriendo el tipo de cada columna.
    pub fn from_rows(names: &[String], rows: Vec<Vec<Value>>) -> Result<Self> {
        let mut cols: Vec<Vec<Value>> = vec![Vec::with_capacity(rows.len()); names.len()];
        for mut row in rows {
            row.resize(names.len(), Value::Null);
            for (i, v) in row.into_iter().enumerate() {
                cols[i].push(v);
            }
        }
        let columns = names
            .iter()
            .zip(cols)
            .map(|(n, vals)| Column::from_values(n.clone(), vals))
            .collect();
        Self::new(columns)
    }

    /// Construye desde registros JSON (objetos). Las columnas siguen el orden
    /// en que aparece cada clave por primera vez.
    pub fn from_records(records: &[Json]) -> Result<Self> {
        let mut names: Vec<String> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        for rec in records {
            let obj = rec.as_object().ok_or_else(|| {
                EtlError::io(format!("se esperaba un objeto JSON por registro, llegó: {rec}"))
            })?;
            for k in obj.keys() {
                if !index.contains_key(k) {
                    index.insert(k.clone(), names.len());
                    names.push(k.clone());
                }
            }
        }

        let rows = records
            .iter()
            .filter_map(Json::as_object)
            .map(|obj| {
                names
                    .iter()
                    .map(|n| obj.get(n).map(Value::from_json).unwrap_or(Value::Null))
                    .collect()
            })
            .collect();
        Self::from_rows(&names, rows)
    }

    pub fn to_records(&self) -> Vec<Json> {
        (0..self.height)
            .map(|i| {
                let mut obj = Map::new();
                for c in &self.columns {
                    obj.insert(c.name.clone(), c.get(i).to_json());
                }
                Json::Object(obj)
            })
            .collect()
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.height == 0
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Como `column`, pero una columna ausente es un `TransformError`.
    pub fn require(&self, name: &str) -> Result<&Column> {
        self.column(name).ok_or_else(|| {
            EtlError::transform(format!(
                "la columna '{name}' no existe (disponibles: {})",
                self.column_names().join(", ")
            ))
        })
    }

    pub fn row(&self, i: usize) -> Vec<&Value> {
        self.columns.iter().map(|c| c.get(i)).collect()
    }

    /// Añade o reemplaza (mismo nombre, misma posición) una columna.
    pub fn with_column(&self, column: Column) -> Result<DataFrame> {
        if !self.columns.is_empty() && column.len() != self.height {
            return Err(EtlError::transform(format!(
                "la columna '{}' tiene {} filas, se esperaban {}",
                column.name,
                column.len(),
                self.height
            )));
        }
        let mut columns = self.columns.clone();
        match self.column_index(&column.name) {
            Some(i) => columns[i] = column,
            None => columns.push(column),
        }
        let height = columns.first().map(Column::len).unwrap_or(0);
        Ok(DataFrame { columns, height })
    }

    /// Proyección en el orden dado. Todos los nombres deben existir.
    pub fn select(&self, names: &[&str]) -> Result<DataFrame> {
        let columns = names
            .iter()
            .map(|n| self.require(n).cloned())
            .collect::<Result<Vec<_>>>()?;
        DataFrame::new(columns).map(|df| df.with_height(self.height))
    }

    pub fn drop_columns(&self, names: &[&str]) -> DataFrame {
        let columns = self
            .columns
            .iter()
            .filter(|c| !names.contains(&c.name.as_str()))
            .cloned()
            .collect();
        DataFrame {
            columns,
            height: self.height,
        }
        .normalized()
    }

    pub fn take(&self, rows: &[usize]) -> DataFrame {
        DataFrame {
            columns: self.columns.iter().map(|c| c.take(rows)).collect(),
            height: rows.len(),
        }
    }

    pub fn filter(&self, mask: &[bool]) -> DataFrame {
        let rows: Vec<usize> = mask
            .iter()
            .enumerate()
            .filter_map(|(i, keep)| keep.then_some(i))
            .collect();
        self.take(&rows)
    }

    pub fn slice(&self, offset: usize, len: usize) -> DataFrame {
        let start = offset.min(self.height);
        let end = start.saturating_add(len).min(self.height);
        let rows: Vec<usize> = (start..end).collect();
        self.take(&rows)
    }

    /// Apila filas por nombre de columna. Columnas que falten en un lado
    /// se rellenan con nulos y los tipos se unifican.
    pub fn vstack(&self, other: &DataFrame) -> Result<DataFrame> {
        if self.columns.is_empty() {
            return Ok(other.clone());
        }
        if other.columns.is_empty() {
            return Ok(self.clone());
        }
        let mut names = self.column_names();
        for n in other.column_names() {
            if !names.contains(&n) {
                names.push(n);
            }
        }
        let columns = names
            .iter()
            .map(|n| {
                let top = self.column(n);
                let bottom = other.column(n);
                let dtype = match (top, bottom) {
                    (Some(a), Some(b)) => unify_types(a.dtype, b.dtype),
                    (Some(a), None) => a.dtype,
                    (None, Some(b)) => b.dtype,
                    (None, None) => DataType::Utf8,
                };
                let mut values = Vec::with_capacity(self.height + other.height);
                match top {
                    Some(c) => values.extend(c.values.iter().cloned()),
                    None => values.extend(std::iter::repeat(Value::Null).take(self.height)),
                }
                match bottom {
                    Some(c) => values.extend(c.values.iter().cloned()),
                    None => values.extend(std::iter::repeat(Value::Null).take(other.height)),
                }
                Column::new(n.clone(), dtype, values)
            })
            .collect();
        DataFrame::new(columns)
    }

    fn with_height(mut self, height: usize) -> Self {
        if self.columns.is_empty() {
            self.height = height;
        }
        self
    }

    fn normalized(mut self) -> Self {
        if let Some(c) = self.columns.first() {
            self.height = c.len();
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> DataFrame {
        DataFrame::from_records(&[
            json!({"id": 1, "name": "ana", "score": 1.5}),
            json!({"id": 2, "name": "bob", "score": null}),
        ])
        .unwrap()
    }

    #[test]
    fn from_records_infiere_tipos_y_orden() {
        let df = sample();
        assert_eq!(df.column_names(), vec!["id", "name", "score"]);
        assert_eq!(df.column("id").unwrap().dtype(), DataType::Int64);
        assert_eq!(df.column("name").unwrap().dtype(), DataType::Utf8);
        assert_eq!(df.column("score").unwrap().dtype(), DataType::Float64);
        assert_eq!(df.height(), 2);
    }

    #[test]
    fn enteros_y_flotantes_mezclados_se_unifican() {
        let df = DataFrame::from_records(&[json!({"x": 1}), json!({"x": 2.5})]).unwrap();
        let c = df.column("x").unwrap();
        assert_eq!(c.dtype(), DataType::Float64);
        assert_eq!(c.values(), &[Value::Float(1.0), Value::Float(2.5)]);
    }

    #[test]
    fn to_records_respeta_nulos() {
        let recs = sample().to_records();
        assert_eq!(recs[1], json!({"id": 2, "name": "bob", "score": null}));
    }

    #[test]
    fn new_rechaza_nombres_duplicados() {
        let a = Column::from_values("a", vec![Value::Int(1)]);
        let err = DataFrame::new(vec![a.clone(), a]).unwrap_err();
        assert_eq!(err.tag(), "TransformError");
    }

    #[test]
    fn select_y_filter() {
        let df = sample();
        let sel = df.select(&["name", "id"]).unwrap();
        assert_eq!(sel.column_names(), vec!["name", "id"]);

        let f = df.filter(&[false, true]);
        assert_eq!(f.height(), 1);
        assert_eq!(f.column("name").unwrap().get(0), &Value::from("bob"));
    }

    #[test]
    fn vstack_une_columnas_por_nombre() {
        let a = DataFrame::from_records(&[json!({"x": 1})]).unwrap();
        let b = DataFrame::from_records(&[json!({"x": 2, "y": "z"})]).unwrap();
        let s = a.vstack(&b).unwrap();
        assert_eq!(s.height(), 2);
        assert_eq!(s.column("y").unwrap().values(), &[Value::Null, Value::from("z")]);
    }

    #[test]
    fn with_column_reemplaza_en_su_posicion() {
        let df = sample();
        let out = df
            .with_column(Column::from_values("id", vec![Value::Int(9), Value::Int(8)]))
            .unwrap();
        assert_eq!(out.column_names(), vec!["id", "name", "score"]);
        assert_eq!(out.column("id").unwrap().get(0), &Value::Int(9));
    }
}
