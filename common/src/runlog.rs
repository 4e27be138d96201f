//! Logs de ejecución ("sidecar") junto al archivo de proyecto.
//!
//! Un archivo por ejecución, con líneas `YYYY-MM-DDTHH:MM:SS | [LEVEL] mensaje`.
//! Estructura bajo `<proyecto>.logs/`:
//!
//! - `etls/<etl>/<ts>.log`
//! - `jobs/<job>/<ts>.log` y `jobs/<job>/<ts>-<paso>-<etl>.log`
//! - `services/<servicio>/<ts>.log`

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Local;
use tracing::{error, info, warn};

use crate::engine::{Phase, ProgressEvent, ProgressListener};
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        }
    }
}

/// Reemplaza todo lo que no sea `[A-Za-z0-9_-]` por `_`.
pub fn slug(name: &str) -> String {
    let s: String = name
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    if s.is_empty() {
        "_".to_string()
    } else {
        s
    }
}

/// Marca de tiempo para nombres de archivo: `YYYYMMDD-HHMMSS-mmm`.
pub fn file_timestamp() -> String {
    Local::now().format("%Y%m%d-%H%M%S-%3f").to_string()
}

pub fn format_line(level: Level, message: &str) -> String {
    format!("{} | [{}] {}", Local::now().format("%Y-%m-%dT%H:%M:%S"), level.as_str(), message)
}

#[derive(Debug)]
pub struct RunLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl RunLog {
    /// Crea `<dir>/<stem>.log`; si ya existe prueba `<stem>-1.log`, `<stem>-2.log`...
    pub fn create(dir: &Path, stem: &str) -> Result<RunLog> {
        fs::create_dir_all(dir)?;
        let mut n = 0usize;
        loop {
            let name = if n == 0 { format!("{stem}.log") } else { format!("{stem}-{n}.log") };
            let path = dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok(RunLog { path, file: Mutex::new(file) }),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => n += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn path_string(&self) -> String {
        self.path.to_string_lossy().to_string()
    }

    /// Escribe una línea. Un fallo de escritura no interrumpe la ejecución.
    pub fn line(&self, level: Level, message: &str) {
        let line = format_line(level, message);
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(file, "{line}") {
            warn!("no se pudo escribir en {}: {e}", self.path.display());
        }
    }

    pub fn info(&self, message: &str) {
        self.line(Level::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.line(Level::Warn, message);
    }

    pub fn error(&self, message: &str) {
        self.line(Level::Error, message);
    }
}

impl ProgressListener for RunLog {
    fn on_event(&self, event: &ProgressEvent) {
        let node = event.node_id.map(|id| format!("nodo {id}: ")).unwrap_or_default();
        let message = format!("{node}{}", event.message);
        match event.phase {
            Phase::Start | Phase::Ok => {
                info!("{message}");
                self.info(&message);
            }
            Phase::Warn => {
                warn!("{message}");
                self.warn(&message);
            }
            Phase::Fail => {
                error!("{message}");
                self.error(&message);
            }
        }
    }
}

/// Directorios de logs de un proyecto.
#[derive(Debug, Clone)]
pub struct LogLayout {
    root: PathBuf,
}

impl LogLayout {
    /// `demo.fetl` -> `demo.fetl.logs`.
    pub fn for_project(project_path: &Path) -> LogLayout {
        let mut root = project_path.as_os_str().to_owned();
        root.push(".logs");
        LogLayout { root: PathBuf::from(root) }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn etl_dir(&self, etl_name: &str) -> PathBuf {
        self.root.join("etls").join(slug(etl_name))
    }

    pub fn job_dir(&self, job_name: &str) -> PathBuf {
        self.root.join("jobs").join(slug(job_name))
    }

    pub fn service_dir(&self, service_name: &str) -> PathBuf {
        self.root.join("services").join(slug(service_name))
    }

    pub fn etl_log(&self, etl_name: &str) -> Result<Arc<RunLog>> {
        RunLog::create(&self.etl_dir(etl_name), &file_timestamp()).map(Arc::new)
    }

    /// Log del job; devuelve también la marca usada, que comparten los logs de sus pasos.
    pub fn job_log(&self, job_name: &str) -> Result<(Arc<RunLog>, String)> {
        let ts = file_timestamp();
        let log = RunLog::create(&self.job_dir(job_name), &ts)?;
        Ok((Arc::new(log), ts))
    }

    pub fn job_step_log(&self, job_name: &str, ts: &str, step: &str, etl_name: &str) -> Result<Arc<RunLog>> {
        let stem = format!("{ts}-{}-{}", slug(step), slug(etl_name));
        RunLog::create(&self.job_dir(job_name), &stem).map(Arc::new)
    }

    pub fn service_log(&self, service_name: &str) -> Result<Arc<RunLog>> {
        RunLog::create(&self.service_dir(service_name), &file_timestamp()).map(Arc::new)
    }
}
