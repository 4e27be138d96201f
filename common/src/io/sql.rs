//! Orígenes y destinos SQL.
//!
//! El motor habla con las bases de datos a través de `SqlDriver`. El registro
//! `SqlDrivers` trae `sqlite` incluido; otros motores (mysql, postgres...) se
//! registran desde fuera con el nombre de su `db_type`.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, OpenFlags};
use serde::{Deserialize, Deserializer};
use tracing::warn;

use crate::config::flex;
use crate::error::{EtlError, Result};
use crate::frame::DataFrame;
use crate::io::resolve_path;
use crate::value::{DataType, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    #[default]
    Preferred,
    Required,
    Disabled,
}

impl SslMode {
    pub fn parse(s: &str) -> Option<SslMode> {
        match s.trim().to_ascii_lowercase().as_str() {
            "preferred" | "prefer" => Some(SslMode::Preferred),
            "required" | "require" | "true" => Some(SslMode::Required),
            "disabled" | "disable" | "false" => Some(SslMode::Disabled),
            _ => None,
        }
    }

    /// Modo a probar en el reintento tras un fallo de handshake.
    pub fn opposite(self) -> SslMode {
        match self {
            SslMode::Required => SslMode::Disabled,
            SslMode::Disabled => SslMode::Required,
            SslMode::Preferred => SslMode::Disabled,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SslMode::Preferred => "PREFERRED",
            SslMode::Required => "REQUIRED",
            SslMode::Disabled => "DISABLED",
        }
    }
}

fn ssl_mode<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<SslMode>, D::Error> {
    use serde::de::Error as _;
    match flex::opt_string(d)? {
        None => Ok(None),
        Some(s) => SslMode::parse(&s)
            .map(Some)
            .ok_or_else(|| D::Error::custom(format!("ssl_mode '{s}' desconocido"))),
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DbConnection {
    #[serde(default, deserialize_with = "flex::opt_string")]
    pub db_type: Option<String>,
    #[serde(default, deserialize_with = "flex::opt_string")]
    pub host: Option<String>,
    #[serde(default, deserialize_with = "flex::opt_usize")]
    pub port: Option<usize>,
    #[serde(default, deserialize_with = "flex::opt_string")]
    pub user: Option<String>,
    #[serde(default, deserialize_with = "flex::opt_string")]
    pub password: Option<String>,
    /// Para sqlite es la ruta del archivo.
    #[serde(default, deserialize_with = "flex::opt_string")]
    pub database: Option<String>,
    #[serde(default, deserialize_with = "ssl_mode")]
    pub ssl_mode: Option<SslMode>,
}

impl DbConnection {
    /// `db_type` normalizado; sin valor se asume sqlite.
    pub fn driver_name(&self) -> String {
        self.db_type
            .as_deref()
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "sqlite".to_string())
    }

    pub fn is_mysql(&self) -> bool {
        matches!(self.driver_name().as_str(), "mysql" | "mariadb")
    }

    /// Para sqlite, resuelve `database` contra el directorio del proyecto.
    pub fn resolved(&self, base: &Path) -> DbConnection {
        let mut out = self.clone();
        if self.driver_name() == "sqlite" {
            if let Some(db) = self.database.as_deref().filter(|d| *d != ":memory:") {
                out.database = Some(resolve_path(base, db).to_string_lossy().to_string());
            }
        }
        out
    }

    pub fn with_ssl_mode(&self, mode: SslMode) -> DbConnection {
        DbConnection {
            ssl_mode: Some(mode),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DbSource {
    #[serde(flatten)]
    pub conn: DbConnection,
    #[serde(default, deserialize_with = "flex::opt_string")]
    pub query: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IfExists {
    #[default]
    Fail,
    Replace,
    Append,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DbSink {
    #[serde(flatten)]
    pub conn: DbConnection,
    #[serde(default, deserialize_with = "flex::opt_string")]
    pub table: Option<String>,
    #[serde(default)]
    pub if_exists: IfExists,
}

/* =========================
   Drivers
   ========================= */

/// Operaciones bloqueantes; el motor las ejecuta en `spawn_blocking`.
pub trait SqlDriver: Send + Sync {
    fn query(&self, conn: &DbConnection, sql: &str) -> Result<DataFrame>;

    /// Devuelve el número de filas escritas.
    fn write(&self, conn: &DbConnection, table: &str, df: &DataFrame, if_exists: IfExists) -> Result<usize>;
}

#[derive(Clone)]
pub struct SqlDrivers {
    drivers: HashMap<String, Arc<dyn SqlDriver>>,
}

impl Default for SqlDrivers {
    fn default() -> Self {
        let mut d = Self::empty();
        d.register("sqlite", Arc::new(SqliteDriver));
        d
    }
}

impl fmt::Debug for SqlDrivers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.drivers.keys().collect();
        names.sort();
        f.debug_struct("SqlDrivers").field("drivers", &names).finish()
    }
}

impl SqlDrivers {
    pub fn empty() -> Self {
        Self {
            drivers: HashMap::new(),
        }
    }

    pub fn register(&mut self, db_type: &str, driver: Arc<dyn SqlDriver>) {
        self.drivers.insert(db_type.trim().to_ascii_lowercase(), driver);
    }

    pub fn get(&self, db_type: &str) -> Result<Arc<dyn SqlDriver>> {
        self.drivers
            .get(db_type)
            .cloned()
            .ok_or_else(|| EtlError::config(format!("no hay driver SQL registrado para '{db_type}'")))
    }
}

/// Heurística de "parece un error SSL": texto con ssl/tls/handshake o el
/// código de cliente MySQL 2026 (SSL connection error).
pub fn looks_like_ssl_error(message: &str) -> bool {
    let m = message.to_ascii_lowercase();
    m.contains("ssl") || m.contains("tls") || m.contains("handshake") || m.contains("2026")
}

/// Ejecuta `op`; si la conexión es MySQL y el error parece SSL, reintenta una
/// única vez con el modo SSL opuesto.
pub fn with_ssl_retry<T>(conn: &DbConnection, mut op: impl FnMut(&DbConnection) -> Result<T>) -> Result<T> {
    match op(conn) {
        Err(e) if conn.is_mysql() && is_ssl_failure(&e) => {
            let mode = conn.ssl_mode.unwrap_or_default().opposite();
            warn!("error SSL en {}: {e}; reintentando con ssl_mode={}", conn.driver_name(), mode.as_str());
            op(&conn.with_ssl_mode(mode))
        }
        other => other,
    }
}

fn is_ssl_failure(e: &EtlError) -> bool {
    match e {
        EtlError::Io { ssl: true, .. } => true,
        EtlError::Io { message, .. } => looks_like_ssl_error(message),
        _ => false,
    }
}

/* =========================
   sqlite (rusqlite)
   ========================= */

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDriver;

fn sql_err(e: rusqlite::Error) -> EtlError {
    let message = format!("sqlite: {e}");
    EtlError::Io {
        ssl: looks_like_ssl_error(&message),
        message,
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

impl SqliteDriver {
    fn open(conn: &DbConnection, read_only: bool) -> Result<Connection> {
        let db = conn
            .database
            .as_deref()
            .ok_or_else(|| EtlError::config("sqlite: falta 'database' (ruta del archivo)"))?;
        if db == ":memory:" {
            return Connection::open_in_memory().map_err(sql_err);
        }
        let flags = if read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX
        } else {
            OpenFlags::default()
        };
        Connection::open_with_flags(db, flags).map_err(sql_err)
    }
}

impl SqlDriver for SqliteDriver {
    fn query(&self, conn: &DbConnection, sql: &str) -> Result<DataFrame> {
        let db = Self::open(conn, true)?;
        let mut stmt = db.prepare(sql).map_err(sql_err)?;
        let names: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();

        let mut rows_out: Vec<Vec<Value>> = Vec::new();
        let mut rows = stmt.query([]).map_err(sql_err)?;
        while let Some(row) = rows.next().map_err(sql_err)? {
            let mut cells = Vec::with_capacity(names.len());
            for i in 0..names.len() {
                let cell = match row.get_ref(i).map_err(sql_err)? {
                    ValueRef::Null => Value::Null,
                    ValueRef::Integer(n) => Value::Int(n),
                    ValueRef::Real(f) => Value::Float(f),
                    ValueRef::Text(t) => Value::Str(String::from_utf8_lossy(t).into_owned()),
                    ValueRef::Blob(b) => Value::Str(String::from_utf8_lossy(b).into_owned()),
                };
                cells.push(cell);
            }
            rows_out.push(cells);
        }
        DataFrame::from_rows(&names, rows_out)
    }

    fn write(&self, conn: &DbConnection, table: &str, df: &DataFrame, if_exists: IfExists) -> Result<usize> {
        let mut db = Self::open(conn, false)?;
        let exists: i64 = db
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |r| r.get(0),
            )
            .map_err(sql_err)?;

        let tx = db.transaction().map_err(sql_err)?;
        let create = match (exists > 0, if_exists) {
            (true, IfExists::Fail) => {
                return Err(EtlError::io(format!("la tabla '{table}' ya existe (if_exists=fail)")));
            }
            (true, IfExists::Replace) => {
                tx.execute(&format!("DROP TABLE {}", quote_ident(table)), [])
                    .map_err(sql_err)?;
                true
            }
            (true, IfExists::Append) => false,
            (false, _) => true,
        };

        if create {
            let cols: Vec<String> = df
                .columns()
                .iter()
                .map(|c| format!("{} {}", quote_ident(c.name()), sqlite_type(c.dtype())))
                .collect();
            tx.execute(&format!("CREATE TABLE {} ({})", quote_ident(table), cols.join(", ")), [])
                .map_err(sql_err)?;
        }

        if df.width() > 0 {
            let names: Vec<String> = df.columns().iter().map(|c| quote_ident(c.name())).collect();
            let holes: Vec<String> = (1..=names.len()).map(|i| format!("?{i}")).collect();
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(table),
                names.join(", "),
                holes.join(", ")
            );
            let mut stmt = tx.prepare(&sql).map_err(sql_err)?;
            for i in 0..df.height() {
                let params: Vec<SqlValue> = df.row(i).into_iter().map(to_sql_value).collect();
                stmt.execute(params_from_iter(params.iter())).map_err(sql_err)?;
            }
        }
        tx.commit().map_err(sql_err)?;
        Ok(df.height())
    }
}

fn sqlite_type(dtype: DataType) -> &'static str {
    match dtype {
        DataType::Int64 | DataType::Int32 | DataType::Boolean => "INTEGER",
        DataType::Float64 | DataType::Float32 => "REAL",
        _ => "TEXT",
    }
}

fn to_sql_value(v: &Value) -> SqlValue {
    match v {
        v if v.is_null() => SqlValue::Null,
        Value::Int(i) => SqlValue::Integer(*i),
        Value::Float(f) => SqlValue::Real(*f),
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        other => other.to_text().map(SqlValue::Text).unwrap_or(SqlValue::Null),
    }
}
