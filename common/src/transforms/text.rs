//! Transformaciones de texto y de fechas sobre una columna.

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Timelike};
use serde::Deserialize;

use crate::config::flex;
use crate::error::{EtlError, Result};
use crate::frame::{Column, DataFrame};
use crate::transforms::select::require_column;
use crate::value::{check_format, parse_datetime, render, DataType, Value, ISO_DATE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextOp {
    Upper,
    Lower,
    Trim,
    StripPrefix,
    StripSuffix,
    Replace,
    Slice,
    PadLeft,
    Title,
    Length,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TextTransformSpec {
    pub column: String,
    pub op: TextOp,
    /// Sin `new_col` se reemplaza la columna original.
    #[serde(default, deserialize_with = "flex::opt_string")]
    pub new_col: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub replacement: Option<String>,
    #[serde(default, deserialize_with = "flex::opt_i64")]
    pub start: Option<i64>,
    #[serde(default, deserialize_with = "flex::opt_usize")]
    pub length: Option<usize>,
    #[serde(default, deserialize_with = "flex::opt_usize")]
    pub width: Option<usize>,
    #[serde(default, deserialize_with = "flex::opt_char")]
    pub fill: Option<char>,
}

fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut at_start = true;
    for c in s.chars() {
        if c.is_alphanumeric() {
            if at_start {
                out.extend(c.to_uppercase());
            } else {
                out.extend(c.to_lowercase());
            }
            at_start = false;
        } else {
            out.push(c);
            at_start = true;
        }
    }
    out
}

impl TextTransformSpec {
    fn pattern(&self) -> Result<&str> {
        self.pattern
            .as_deref()
            .ok_or_else(|| EtlError::transform(format!("text_transform {:?} requiere 'pattern'", self.op)))
    }

    fn transform(&self, s: &str) -> Result<Value> {
        let v = match self.op {
            TextOp::Upper => Value::Str(s.to_uppercase()),
            TextOp::Lower => Value::Str(s.to_lowercase()),
            TextOp::Trim => Value::Str(s.trim().to_string()),
            TextOp::StripPrefix => {
                let p = self.pattern()?;
                Value::Str(s.strip_prefix(p).unwrap_or(s).to_string())
            }
            TextOp::StripSuffix => {
                let p = self.pattern()?;
                Value::Str(s.strip_suffix(p).unwrap_or(s).to_string())
            }
            TextOp::Replace => {
                let p = self.pattern()?;
                if p.is_empty() {
                    Value::Str(s.to_string())
                } else {
                    Value::Str(s.replace(p, self.replacement.as_deref().unwrap_or("")))
                }
            }
            TextOp::Slice => {
                let chars: Vec<char> = s.chars().collect();
                let n = chars.len() as i64;
                // inicio negativo cuenta desde el final
                let start = match self.start.unwrap_or(0) {
                    i if i < 0 => (n + i).max(0),
                    i => i.min(n),
                } as usize;
                let end = self.length.map_or(chars.len(), |l| (start + l).min(chars.len()));
                Value::Str(chars[start..end].iter().collect())
            }
            TextOp::PadLeft => {
                let width = self.width.unwrap_or(0);
                let fill = self.fill.unwrap_or(' ');
                let len = s.chars().count();
                let pad: String = std::iter::repeat(fill).take(width.saturating_sub(len)).collect();
                Value::Str(format!("{pad}{s}"))
            }
            TextOp::Title => Value::Str(title_case(s)),
            TextOp::Length => Value::Int(s.chars().count() as i64),
        };
        Ok(v)
    }

    pub fn apply(&self, df: &DataFrame) -> Result<DataFrame> {
        let name = require_column(df, &self.column)?;
        let col = df.require(&name)?;
        let values = col
            .values()
            .iter()
            .map(|v| match v.to_text() {
                Some(s) => self.transform(&s),
                None => Ok(Value::Null),
            })
            .collect::<Result<Vec<_>>>()?;
        let dtype = if self.op == TextOp::Length { DataType::Int64 } else { DataType::Utf8 };
        let out_name = self.new_col.clone().unwrap_or(name);
        df.with_column(Column::new(out_name, dtype, values))
    }
}

/* =========================
   date_transform
   ========================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateOp {
    Year,
    Month,
    Day,
    Weekday,
    Hour,
    Minute,
    TruncateMonth,
    AddDays,
    DiffDays,
    Format,
}

impl DateOp {
    fn as_str(self) -> &'static str {
        match self {
            DateOp::Year => "year",
            DateOp::Month => "month",
            DateOp::Day => "day",
            DateOp::Weekday => "weekday",
            DateOp::Hour => "hour",
            DateOp::Minute => "minute",
            DateOp::TruncateMonth => "truncate_month",
            DateOp::AddDays => "add_days",
            DateOp::DiffDays => "diff_days",
            DateOp::Format => "format",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DateTransformSpec {
    pub column: String,
    pub op: DateOp,
    #[serde(default, deserialize_with = "flex::opt_string")]
    pub new_col: Option<String>,
    #[serde(default, deserialize_with = "flex::opt_i64")]
    pub days: Option<i64>,
    /// Columna a restar en `diff_days`.
    #[serde(default, deserialize_with = "flex::opt_string")]
    pub other: Option<String>,
    /// Formato de salida en `format`; en el resto, formato de lectura del texto.
    #[serde(default, deserialize_with = "flex::opt_string")]
    pub fmt: Option<String>,
}

/// Fecha/hora de una celda; el texto se interpreta con `fmt` o ISO.
fn datetime_of(v: &Value, fmt: Option<&str>) -> Option<NaiveDateTime> {
    match v {
        Value::Datetime(dt) => Some(*dt),
        Value::Date(d) => Some(d.and_time(NaiveTime::MIN)),
        Value::Str(s) => parse_datetime(s, fmt),
        _ => None,
    }
}

impl DateTransformSpec {
    pub fn validated(self) -> Result<Self> {
        if let Some(fmt) = &self.fmt {
            check_format(fmt)?;
        }
        Ok(self)
    }

    pub fn apply(&self, df: &DataFrame) -> Result<DataFrame> {
        let name = require_column(df, &self.column)?;
        let col = df.require(&name)?;
        let fmt = if self.op == DateOp::Format { None } else { self.fmt.as_deref() };
        let other = match (&self.op, &self.other) {
            (DateOp::DiffDays, Some(o)) => Some(df.require(&require_column(df, o)?)?),
            (DateOp::DiffDays, None) => return Err(EtlError::transform("date_transform diff_days requiere 'other'")),
            _ => None,
        };
        let keep_datetime = col.dtype() == DataType::Datetime;

        let values: Vec<Value> = col
            .values()
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let Some(dt) = datetime_of(v, fmt) else {
                    return Value::Null;
                };
                let d = dt.date();
                match self.op {
                    DateOp::Year => Value::Int(i64::from(d.year())),
                    DateOp::Month => Value::Int(i64::from(d.month())),
                    DateOp::Day => Value::Int(i64::from(d.day())),
                    DateOp::Weekday => Value::Int(i64::from(d.weekday().number_from_monday())),
                    DateOp::Hour => Value::Int(i64::from(dt.hour())),
                    DateOp::Minute => Value::Int(i64::from(dt.minute())),
                    DateOp::TruncateMonth => NaiveDate::from_ymd_opt(d.year(), d.month(), 1)
                        .map(Value::Date)
                        .unwrap_or(Value::Null),
                    DateOp::AddDays => {
                        let shifted = TimeDelta::try_days(self.days.unwrap_or(0))
                            .and_then(|delta| dt.checked_add_signed(delta));
                        match shifted {
                            Some(s) if keep_datetime => Value::Datetime(s),
                            Some(s) => Value::Date(s.date()),
                            None => Value::Null,
                        }
                    }
                    DateOp::DiffDays => other
                        .and_then(|o| datetime_of(o.get(i), fmt))
                        .map(|o| Value::Int(d.signed_duration_since(o.date()).num_days()))
                        .unwrap_or(Value::Null),
                    DateOp::Format => {
                        let f = self.fmt.as_deref().unwrap_or(ISO_DATE);
                        render(dt.format(f)).map(Value::Str).unwrap_or(Value::Null)
                    }
                }
            })
            .collect();

        let dtype = match self.op {
            DateOp::TruncateMonth => DataType::Date,
            DateOp::AddDays if keep_datetime => DataType::Datetime,
            DateOp::AddDays => DataType::Date,
            DateOp::Format => DataType::Utf8,
            _ => DataType::Int64,
        };
        let out_name = self
            .new_col
            .clone()
            .unwrap_or_else(|| format!("{name}_{}", self.op.as_str()));
        df.with_column(Column::new(out_name, dtype, values))
    }
}
