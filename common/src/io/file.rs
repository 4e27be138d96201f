//! Orígenes y destinos de archivo (CSV, JSON / JSON Lines).
//!
//! Excel y Parquet se aceptan en el documento pero su lectura/escritura no
//! está incluida en el motor; fallan con `IOError` al ejecutar.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::flex;
use crate::error::{EtlError, Result};
use crate::frame::{Column, DataFrame};
use crate::io::{ensure_parent, records_from_json, resolve_path};
use crate::value::{DataType, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileFormat {
    #[default]
    Csv,
    Excel,
    Json,
    Parquet,
}

impl FileFormat {
    pub fn parse(s: &str) -> Option<FileFormat> {
        match s {
            "csv" => Some(FileFormat::Csv),
            "excel" => Some(FileFormat::Excel),
            "json" => Some(FileFormat::Json),
            "parquet" => Some(FileFormat::Parquet),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileFormat::Csv => "csv",
            FileFormat::Excel => "excel",
            FileFormat::Json => "json",
            FileFormat::Parquet => "parquet",
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileSource {
    #[serde(skip)]
    pub format: FileFormat,

    /// Ruta o patrón glob, ej: "data/*.csv".
    #[serde(default, deserialize_with = "flex::opt_string")]
    pub path: Option<String>,

    #[serde(default, deserialize_with = "flex::opt_char")]
    pub delimiter: Option<char>,

    #[serde(default = "default_true", deserialize_with = "flex::bool")]
    pub has_header: bool,

    /// Registros en línea (sólo JSON); tienen prioridad sobre `path`.
    #[serde(default)]
    pub records: Option<Vec<Json>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JsonLayout {
    #[default]
    Records,
    Lines,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileSink {
    #[serde(skip)]
    pub format: FileFormat,

    #[serde(default, deserialize_with = "flex::opt_string")]
    pub path: Option<String>,

    /// Para JSON: "records" (array) o "lines" (un objeto por línea).
    #[serde(default, rename = "format", deserialize_with = "flex::opt_string")]
    pub layout: Option<String>,

    #[serde(default, deserialize_with = "flex::opt_char")]
    pub delimiter: Option<char>,
}

impl FileSink {
    pub fn json_layout(&self) -> JsonLayout {
        match self.layout.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("lines" | "jsonl" | "ndjson") => JsonLayout::Lines,
            _ => JsonLayout::Records,
        }
    }
}

/* =========================
   Lectura
   ========================= */

/// Lee un origen de archivo. Si `path` es un glob, se leen todos los
/// archivos que coinciden en orden lexicográfico y se apilan.
pub fn read_source(src: &FileSource, base: &Path, stop: &CancellationToken) -> Result<DataFrame> {
    if let Some(records) = &src.records {
        return DataFrame::from_records(records);
    }
    let raw = src
        .path
        .as_deref()
        .ok_or_else(|| EtlError::config(format!("origen {} sin 'path'", src.format.as_str())))?;

    let mut out = DataFrame::empty();
    for path in expand_path(base, raw)? {
        if stop.is_cancelled() {
            return Err(EtlError::Cancelled);
        }
        debug!("leyendo {}", path.display());
        let df = match src.format {
            FileFormat::Csv => read_csv(&path, src.delimiter, src.has_header)?,
            FileFormat::Json => read_json(&path)?,
            other => return Err(unsupported(other)),
        };
        out = out.vstack(&df)?;
    }
    Ok(out)
}

fn expand_path(base: &Path, raw: &str) -> Result<Vec<PathBuf>> {
    let full = resolve_path(base, raw);
    if !raw.contains(['*', '?', '[']) {
        return Ok(vec![full]);
    }
    let pattern = full.to_string_lossy().to_string();
    let mut paths: Vec<PathBuf> = glob::glob(&pattern)
        .map_err(|e| EtlError::config(format!("patrón '{raw}' inválido: {e}")))?
        .filter_map(std::result::Result::ok)
        .filter(|p| p.is_file())
        .collect();
    paths.sort();
    if paths.is_empty() {
        return Err(EtlError::io(format!("ningún archivo coincide con '{raw}'")));
    }
    Ok(paths)
}

fn unsupported(format: FileFormat) -> EtlError {
    EtlError::io(format!("el formato {} no está disponible en este motor", format.as_str()))
}

fn open(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| EtlError::io(format!("no se pudo abrir {}: {e}", path.display())))
}

pub fn read_csv(path: &Path, delimiter: Option<char>, has_header: bool) -> Result<DataFrame> {
    let file = open(path)?;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter.map(|c| c as u8).unwrap_or(b','))
        .has_headers(has_header)
        .flexible(true)
        .from_reader(BufReader::new(file));

    let mut headers: Vec<String> = if has_header {
        reader
            .headers()?
            .iter()
            // Limpia BOM por si viene de Excel/Windows
            .map(|h| h.trim().trim_start_matches('\u{feff}').to_string())
            .collect()
    } else {
        Vec::new()
    };

    let mut cells: Vec<Vec<Option<String>>> = vec![Vec::new(); headers.len()];
    let mut rows = 0usize;
    for record in reader.records() {
        let record = record?;
        if record.iter().all(|c| c.trim().is_empty()) {
            continue;
        }
        while headers.len() < record.len() {
            headers.push(format!("column_{}", headers.len() + 1));
            cells.push(vec![None; rows]);
        }
        for (i, col) in cells.iter_mut().enumerate() {
            let raw = record.get(i).map(str::trim).unwrap_or("");
            col.push((!raw.is_empty()).then(|| raw.to_string()));
        }
        rows += 1;
    }

    let columns = headers
        .into_iter()
        .zip(cells)
        .map(|(name, values)| infer_text_column(name, values))
        .collect();
    DataFrame::new(columns)
}

/// Infiere el tipo de una columna leída como texto: Int64, Float64,
/// Boolean o Utf8, en ese orden de preferencia.
pub fn infer_text_column(name: String, values: Vec<Option<String>>) -> Column {
    let present = || values.iter().flatten();
    let dtype = if present().next().is_none() {
        DataType::Utf8
    } else if present().all(|s| s.parse::<i64>().is_ok()) {
        DataType::Int64
    } else if present().all(|s| s.parse::<f64>().is_ok()) {
        DataType::Float64
    } else if present().all(|s| matches!(s.to_ascii_lowercase().as_str(), "true" | "false")) {
        DataType::Boolean
    } else {
        DataType::Utf8
    };

    let cells = values
        .into_iter()
        .map(|v| match v {
            None => Value::Null,
            Some(s) => match dtype {
                DataType::Int64 => s.parse().map(Value::Int).unwrap_or(Value::Null),
                DataType::Float64 => s.parse().map(Value::Float).unwrap_or(Value::Null),
                DataType::Boolean => Value::Bool(s.eq_ignore_ascii_case("true")),
                _ => Value::Str(s),
            },
        })
        .collect();
    Column::new(name, dtype, cells)
}

/// Acepta un array JSON, un objeto que envuelve un array o JSON Lines.
pub fn read_json(path: &Path) -> Result<DataFrame> {
    let text = fs::read_to_string(path)
        .map_err(|e| EtlError::io(format!("no se pudo leer {}: {e}", path.display())))?;
    let text = text.trim_start_matches('\u{feff}');
    if text.trim().is_empty() {
        return Ok(DataFrame::empty());
    }

    let records = match serde_json::from_str::<Json>(text) {
        Ok(doc) => records_from_json(doc, None)?,
        Err(_) => read_json_lines(text.as_bytes(), path)?,
    };
    DataFrame::from_records(&records)
}

fn read_json_lines(bytes: &[u8], path: &Path) -> Result<Vec<Json>> {
    let mut out = Vec::new();
    for (n, line) in BufReader::new(bytes).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let rec: Json = serde_json::from_str(&line).map_err(|e| {
            EtlError::io(format!("JSON inválido en {} línea {}: {e}", path.display(), n + 1))
        })?;
        out.push(rec);
    }
    Ok(out)
}

/* =========================
   Escritura
   ========================= */

/// Escribe el DataFrame y devuelve el número de filas escritas.
pub fn write_sink(sink: &FileSink, df: &DataFrame, base: &Path) -> Result<usize> {
    let raw = sink
        .path
        .as_deref()
        .ok_or_else(|| EtlError::config(format!("destino {} sin 'path'", sink.format.as_str())))?;
    let path = resolve_path(base, raw);
    ensure_parent(&path)?;

    match sink.format {
        FileFormat::Csv => write_csv(&path, df, sink.delimiter)?,
        FileFormat::Json => write_json(&path, df, sink.json_layout())?,
        other => return Err(unsupported(other)),
    }
    Ok(df.height())
}

fn create(path: &Path) -> Result<BufWriter<File>> {
    File::create(path)
        .map(BufWriter::new)
        .map_err(|e| EtlError::io(format!("no se pudo crear {}: {e}", path.display())))
}

pub fn write_csv(path: &Path, df: &DataFrame, delimiter: Option<char>) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter.map(|c| c as u8).unwrap_or(b','))
        .from_writer(create(path)?);
    writer.write_record(df.column_names())?;
    for i in 0..df.height() {
        let row: Vec<String> = df
            .row(i)
            .into_iter()
            .map(|v| v.to_text().unwrap_or_default())
            .collect();
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn write_json(path: &Path, df: &DataFrame, layout: JsonLayout) -> Result<()> {
    let mut writer = create(path)?;
    let records = df.to_records();
    let json_err = |e: serde_json::Error| EtlError::io(format!("error al escribir {}: {e}", path.display()));
    match layout {
        JsonLayout::Records => serde_json::to_writer(&mut writer, &records).map_err(json_err)?,
        JsonLayout::Lines => {
            for rec in &records {
                serde_json::to_writer(&mut writer, rec).map_err(json_err)?;
                writer.write_all(b"\n")?;
            }
        }
    }
    writer.flush()?;
    Ok(())
}
