//! Tipos de columna y valores de celda.
//!
//! Las reglas de conversión entre tipos viven aquí (`cast_value`) porque las
//! usan tanto el operador `cast` como la inferencia al leer fuentes.

use std::cmp::Ordering;
use std::fmt::{self, Write as _};

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub const ISO_DATE: &str = "%Y-%m-%d";
pub const ISO_DATETIME: &str = "%Y-%m-%dT%H:%M:%S%.f";

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    Int64,
    Int32,
    Float64,
    Float32,
    Utf8,
    Boolean,
    Date,
    Datetime,
}

impl DataType {
    /// Acepta los nombres canónicos y los alias habituales de la UI.
    pub fn parse(name: &str) -> Option<DataType> {
        let t = name.trim().to_ascii_lowercase();
        let dt = match t.as_str() {
            "int64" | "int" | "integer" | "i64" | "long" => DataType::Int64,
            "int32" | "i32" => DataType::Int32,
            "float64" | "float" | "double" | "f64" | "number" => DataType::Float64,
            "float32" | "f32" => DataType::Float32,
            "utf8" | "str" | "string" | "text" => DataType::Utf8,
            "boolean" | "bool" => DataType::Boolean,
            "date" => DataType::Date,
            "datetime" | "timestamp" => DataType::Datetime,
            _ => return None,
        };
        Some(dt)
    }

    pub fn is_integer(self) -> bool {
        matches!(self, DataType::Int64 | DataType::Int32)
    }

    pub fn is_float(self) -> bool {
        matches!(self, DataType::Float64 | DataType::Float32)
    }

    pub fn is_numeric(self) -> bool {
        self.is_integer() || self.is_float()
    }

    pub fn is_temporal(self) -> bool {
        matches!(self, DataType::Date | DataType::Datetime)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Valor de una celda. `Int` y `Float` cubren también Int32/Float32; el tipo
/// exacto lo lleva la columna.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Date(NaiveDate),
    Datetime(NaiveDateTime),
}

/// Forma hasheable de un valor, usada como clave en joins y agrupaciones.
/// Los flotantes enteros se normalizan a `Int` para que `2` y `2.0` coincidan.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyValue {
    Null,
    Int(i64),
    Float(u64),
    Str(String),
    Bool(bool),
    Date(i32),
    Datetime(i64),
}

impl Value {
    pub fn is_null(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Float(f) => f.is_nan(),
            _ => false,
        }
    }

    /// Tipo natural del valor; `None` para nulos.
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Int(_) => Some(DataType::Int64),
            Value::Float(_) => Some(DataType::Float64),
            Value::Str(_) => Some(DataType::Utf8),
            Value::Bool(_) => Some(DataType::Boolean),
            Value::Date(_) => Some(DataType::Date),
            Value::Datetime(_) => Some(DataType::Datetime),
        }
    }

    /// Valor numérico. El texto se intenta parsear.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) if !f.is_nan() => Some(*f),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Str(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.is_finite() => Some(f.trunc() as i64),
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Str(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f.trunc() as i64))
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Representación textual; `None` para nulos.
    pub fn to_text(&self) -> Option<String> {
        self.to_text_with(None)
    }

    /// Como `to_text`, pero las fechas se formatean con `fmt` si viene.
    pub fn to_text_with(&self, fmt: Option<&str>) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Int(i) => Some(i.to_string()),
            Value::Float(f) if f.is_nan() => None,
            Value::Float(f) => Some(format_float(*f)),
            Value::Str(s) => Some(s.clone()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Date(d) => render(d.format(fmt.unwrap_or(ISO_DATE))),
            Value::Datetime(dt) => render(dt.format(fmt.unwrap_or(ISO_DATETIME))),
        }
    }

    pub fn key(&self) -> KeyValue {
        match self {
            Value::Null => KeyValue::Null,
            Value::Int(i) => KeyValue::Int(*i),
            Value::Float(f) if f.is_nan() => KeyValue::Null,
            Value::Float(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => KeyValue::Int(*f as i64),
            Value::Float(f) => KeyValue::Float(f.to_bits()),
            Value::Str(s) => KeyValue::Str(s.clone()),
            Value::Bool(b) => KeyValue::Bool(*b),
            Value::Date(d) => KeyValue::Date(d.num_days_from_ce()),
            Value::Datetime(dt) => KeyValue::Datetime(dt.and_utc().timestamp_micros()),
        }
    }

    /// Orden total para ordenar: los nulos van primero, los números se comparan
    /// entre sí aunque mezclen enteros y flotantes, y tipos distintos se
    /// ordenan por rango de tipo.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        use Value::*;
        match (self, other) {
            (a, b) if a.is_null() && b.is_null() => Ordering::Equal,
            (a, _) if a.is_null() => Ordering::Less,
            (_, b) if b.is_null() => Ordering::Greater,
            (Int(a), Int(b)) => a.cmp(b),
            (Int(_) | Float(_), Int(_) | Float(_)) => {
                let (a, b) = (self.as_f64().unwrap_or(0.0), other.as_f64().unwrap_or(0.0));
                a.total_cmp(&b)
            }
            (Str(a), Str(b)) => a.cmp(b),
            (Bool(a), Bool(b)) => a.cmp(b),
            (Date(a), Date(b)) => a.cmp(b),
            (Datetime(a), Datetime(b)) => a.cmp(b),
            (Date(a), Datetime(b)) => a.and_time(NaiveTime::MIN).cmp(b),
            (Datetime(a), Date(b)) => a.cmp(&b.and_time(NaiveTime::MIN)),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 2,
            Value::Date(_) | Value::Datetime(_) => 3,
            Value::Str(_) => 4,
        }
    }

    /// Conversión desde JSON. Arrays y objetos se guardan como texto JSON.
    pub fn from_json(v: &Json) -> Value {
        match v {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
            },
            Json::String(s) => Value::Str(s.clone()),
            other => Value::Str(other.to_string()),
        }
    }

    pub fn to_json(&self) -> Json {
        match self {
            Value::Null => Json::Null,
            Value::Int(i) => Json::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Str(s) => Json::String(s.clone()),
            Value::Bool(b) => Json::Bool(*b),
            Value::Date(_) | Value::Datetime(_) => {
                self.to_text().map(Json::String).unwrap_or(Json::Null)
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_text() {
            Some(s) => f.write_str(&s),
            None => f.write_str("null"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

fn format_float(f: f64) -> String {
    if f.is_infinite() {
        return if f > 0.0 { "inf".into() } else { "-inf".into() };
    }
    f.to_string()
}

/* =========================
   Reglas de conversión
   ========================= */

/// Convierte una celda al tipo `to`. Nunca falla: lo que no se puede
/// convertir queda en nulo.
pub fn cast_value(v: &Value, to: DataType, fmt: Option<&str>) -> Value {
    if v.is_null() {
        return Value::Null;
    }
    match to {
        DataType::Int64 => to_int(v).map(Value::Int).unwrap_or(Value::Null),
        DataType::Int32 => to_int(v)
            .filter(|i| i32::try_from(*i).is_ok())
            .map(Value::Int)
            .unwrap_or(Value::Null),
        DataType::Float64 => to_float(v).map(Value::Float).unwrap_or(Value::Null),
        DataType::Float32 => to_float(v)
            .map(|f| Value::Float(f64::from(f as f32)))
            .unwrap_or(Value::Null),
        DataType::Utf8 => v.to_text_with(fmt).map(Value::Str).unwrap_or(Value::Null),
        DataType::Boolean => to_bool(v).map(Value::Bool).unwrap_or(Value::Null),
        DataType::Date => to_date(v, fmt).map(Value::Date).unwrap_or(Value::Null),
        DataType::Datetime => to_datetime(v, fmt).map(Value::Datetime).unwrap_or(Value::Null),
    }
}

/// Texto de una fecha ya formateada; `None` si el patrón no se puede aplicar.
pub fn render(formatted: impl fmt::Display) -> Option<String> {
    let mut out = String::new();
    write!(out, "{formatted}").ok()?;
    Some(out)
}

/// Rechaza patrones strftime que chrono no entiende (`%Q`, `%` suelto).
pub fn check_format(fmt: &str) -> crate::error::Result<()> {
    if StrftimeItems::new(fmt).any(|item| matches!(item, Item::Error)) {
        return Err(crate::error::EtlError::config(format!("formato de fecha '{fmt}' inválido")));
    }
    Ok(())
}

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

fn to_int(v: &Value) -> Option<i64> {
    match v {
        Value::Date(d) => Some(d.signed_duration_since(epoch()).num_days()),
        Value::Datetime(dt) => Some(dt.and_utc().timestamp_millis()),
        other => other.as_i64(),
    }
}

fn to_float(v: &Value) -> Option<f64> {
    match v {
        Value::Date(_) | Value::Datetime(_) => None,
        other => other.as_f64(),
    }
}

fn to_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Int(i) => Some(*i != 0),
        Value::Float(f) => Some(*f != 0.0),
        Value::Str(s) => parse_bool(s),
        _ => None,
    }
}

pub fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "1" | "yes" | "y" | "si" | "sí" => Some(true),
        "false" | "f" | "0" | "no" | "n" => Some(false),
        _ => None,
    }
}

fn to_date(v: &Value, fmt: Option<&str>) -> Option<NaiveDate> {
    match v {
        Value::Date(d) => Some(*d),
        Value::Datetime(dt) => Some(dt.date()),
        Value::Int(days) => TimeDelta::try_days(*days).and_then(|delta| epoch().checked_add_signed(delta)),
        Value::Str(s) => parse_date(s, fmt),
        _ => None,
    }
}

fn to_datetime(v: &Value, fmt: Option<&str>) -> Option<NaiveDateTime> {
    match v {
        Value::Datetime(dt) => Some(*dt),
        Value::Date(d) => Some(d.and_time(NaiveTime::MIN)),
        Value::Int(ms) => DateTime::from_timestamp_millis(*ms).map(|dt| dt.naive_utc()),
        Value::Str(s) => parse_datetime(s, fmt),
        _ => None,
    }
}

/// Con formato explícito se usa sólo ese formato; sin formato, ISO.
pub fn parse_date(s: &str, fmt: Option<&str>) -> Option<NaiveDate> {
    let s = s.trim();
    match fmt {
        Some(f) => NaiveDate::parse_from_str(s, f)
            .ok()
            .or_else(|| NaiveDateTime::parse_from_str(s, f).ok().map(|dt| dt.date())),
        None => NaiveDate::parse_from_str(s, ISO_DATE)
            .ok()
            .or_else(|| parse_datetime(s, None).map(|dt| dt.date())),
    }
}

pub fn parse_datetime(s: &str, fmt: Option<&str>) -> Option<NaiveDateTime> {
    let s = s.trim();
    if let Some(f) = fmt {
        return NaiveDateTime::parse_from_str(s, f)
            .ok()
            .or_else(|| NaiveDate::parse_from_str(s, f).ok().map(|d| d.and_time(NaiveTime::MIN)));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    DATETIME_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
        .or_else(|| NaiveDate::parse_from_str(s, ISO_DATE).ok().map(|d| d.and_time(NaiveTime::MIN)))
}

/// Tipo común de dos tipos de columna al mezclar valores.
pub fn unify_types(a: DataType, b: DataType) -> DataType {
    use DataType::*;
    match (a, b) {
        (x, y) if x == y => x,
        (x, y) if x.is_integer() && y.is_integer() => Int64,
        (x, y) if x.is_numeric() && y.is_numeric() => Float64,
        (Date, Datetime) | (Datetime, Date) => Datetime,
        _ => Utf8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texto_a_entero_y_flotante() {
        assert_eq!(cast_value(&"42".into(), DataType::Int64, None), Value::Int(42));
        assert_eq!(cast_value(&" 3.9 ".into(), DataType::Int64, None), Value::Int(3));
        assert_eq!(cast_value(&"abc".into(), DataType::Int64, None), Value::Null);
        assert_eq!(cast_value(&"2.5".into(), DataType::Float64, None), Value::Float(2.5));
    }

    #[test]
    fn dias_fuera_de_rango_a_fecha_es_nulo() {
        assert_eq!(cast_value(&Value::Int(i64::MAX), DataType::Date, None), Value::Null);
        assert_eq!(cast_value(&Value::Int(9_000_000_000_000_000_000), DataType::Date, None), Value::Null);
        assert_eq!(
            cast_value(&Value::Int(1), DataType::Date, None),
            Value::Date(NaiveDate::from_ymd_opt(1970, 1, 2).unwrap())
        );
    }

    #[test]
    fn formato_invalido_da_nulo_al_pasar_a_texto() {
        let d = Value::Date(NaiveDate::from_ymd_opt(2024, 3, 5).unwrap());
        assert_eq!(cast_value(&d, DataType::Utf8, Some("%Q")), Value::Null);
        assert_eq!(d.to_text_with(Some("%Q")), None);
        assert!(check_format("%Q").is_err());
        assert_eq!(check_format("%Q").unwrap_err().tag(), "ConfigError");
        assert!(check_format("%d/%m/%Y").is_ok());
    }

    #[test]
    fn int32_fuera_de_rango_es_nulo() {
        assert_eq!(cast_value(&Value::Int(1 << 40), DataType::Int32, None), Value::Null);
        assert_eq!(cast_value(&Value::Int(7), DataType::Int32, None), Value::Int(7));
    }

    #[test]
    fn fecha_con_formato_ida_y_vuelta() {
        let fmt = Some("%d/%m/%Y");
        let d = cast_value(&"05/03/2024".into(), DataType::Date, fmt);
        assert_eq!(d, Value::Date(NaiveDate::from_ymd_opt(2024, 3, 5).unwrap()));
        assert_eq!(cast_value(&d, DataType::Utf8, fmt), Value::Str("05/03/2024".into()));
    }

    #[test]
    fn fecha_mal_formada_es_nula() {
        assert_eq!(cast_value(&"2024-13-40".into(), DataType::Date, None), Value::Null);
        assert_eq!(cast_value(&"xx".into(), DataType::Datetime, None), Value::Null);
    }

    #[test]
    fn datetime_iso_y_rfc3339() {
        let a = cast_value(&"2024-01-02T03:04:05".into(), DataType::Datetime, None);
        let b = cast_value(&"2024-01-02T03:04:05Z".into(), DataType::Datetime, None);
        assert_eq!(a, b);
        assert_eq!(a.to_text().unwrap(), "2024-01-02T03:04:05");
    }

    #[test]
    fn booleanos_desde_texto() {
        assert_eq!(cast_value(&"Yes".into(), DataType::Boolean, None), Value::Bool(true));
        assert_eq!(cast_value(&"0".into(), DataType::Boolean, None), Value::Bool(false));
        assert_eq!(cast_value(&"quizas".into(), DataType::Boolean, None), Value::Null);
    }

    #[test]
    fn claves_normalizan_flotantes_enteros() {
        assert_eq!(Value::Int(2).key(), Value::Float(2.0).key());
        assert_ne!(Value::Int(2).key(), Value::Str("2".into()).key());
    }

    #[test]
    fn orden_total_pone_nulos_primero() {
        let mut v = vec![Value::Int(3), Value::Null, Value::Float(1.5)];
        v.sort_by(|a, b| a.total_cmp(b));
        assert_eq!(v, vec![Value::Null, Value::Float(1.5), Value::Int(3)]);
    }

    #[test]
    fn alias_de_tipos() {
        assert_eq!(DataType::parse(" String "), Some(DataType::Utf8));
        assert_eq!(DataType::parse("timestamp"), Some(DataType::Datetime));
        assert_eq!(DataType::parse("decimal"), None);
    }
}
