//! Documento de proyecto (`.fetl`) y su almacenamiento.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::config::flex;
use crate::dag::EtlDoc;
use crate::error::{EtlError, Result};
use crate::runlog::LogLayout;

pub const DEFAULT_MAX_PARALLEL: usize = 4;
pub const DEFAULT_SERVICE_PORT: u16 = 8765;
pub const DEFAULT_LANG: &str = "es";
pub const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434";

fn default_max_parallel() -> usize {
    DEFAULT_MAX_PARALLEL
}

fn default_port() -> u16 {
    DEFAULT_SERVICE_PORT
}

fn default_lang() -> String {
    DEFAULT_LANG.to_string()
}

fn default_ollama() -> String {
    DEFAULT_OLLAMA_URL.to_string()
}

/* --------- defaults --------- */

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default = "default_max_parallel", deserialize_with = "flex::usize")]
    pub max_parallel: usize,
    #[serde(default)]
    pub services: ServiceDefaults,
    #[serde(default)]
    pub mcp: McpDefaults,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            max_parallel: DEFAULT_MAX_PARALLEL,
            services: ServiceDefaults::default(),
            mcp: McpDefaults::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDefaults {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServiceDefaults {
    fn default() -> Self {
        Self { port: DEFAULT_SERVICE_PORT }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpDefaults {
    #[serde(default = "default_lang")]
    pub lang: String,
    #[serde(default = "default_ollama")]
    pub ollama_base_url: String,
}

impl Default for McpDefaults {
    fn default() -> Self {
        Self { lang: default_lang(), ollama_base_url: default_ollama() }
    }
}

/* --------- jobs --------- */

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    #[default]
    Stop,
    Continue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDoc {
    #[serde(deserialize_with = "flex::id_string")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub on_error: OnError,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "flex::opt_usize")]
    pub max_parallel: Option<usize>,
    #[serde(default)]
    pub stages: Vec<Stage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stage {
    #[serde(default, deserialize_with = "flex::bool")]
    pub parallel: bool,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceAction {
    Start,
    Stop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Step {
    Etl {
        #[serde(deserialize_with = "flex::id_string")]
        etl_id: String,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        overrides: Map<String, Value>,
    },
    Service {
        #[serde(deserialize_with = "flex::id_string")]
        service_id: String,
        action: ServiceAction,
    },
}

impl Step {
    /// Etiqueta corta para logs y nombres de archivo.
    pub fn label(&self) -> String {
        match self {
            Step::Etl { etl_id, .. } => format!("etl {etl_id}"),
            Step::Service { service_id, action } => {
                let a = match action {
                    ServiceAction::Start => "start",
                    ServiceAction::Stop => "stop",
                };
                format!("service {service_id} {a}")
            }
        }
    }
}

/* --------- servicios --------- */

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceDoc {
    #[serde(deserialize_with = "flex::id_string")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Vacío = todos los ETLs del proyecto.
    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "flex::string_list")]
    pub etl_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "flex::string_list")]
    pub job_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "flex::opt_string")]
    pub basic_user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "flex::opt_string")]
    pub basic_pass: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "flex::opt_string")]
    pub jwt_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "flex::opt_string")]
    pub lang: Option<String>,
}

impl ServiceDoc {
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    pub fn exposes_etl(&self, etl_id: &str) -> bool {
        self.etl_ids.is_empty() || self.etl_ids.iter().any(|e| e == etl_id)
    }

    pub fn exposes_job(&self, job_id: &str) -> bool {
        self.job_ids.is_empty() || self.job_ids.iter().any(|j| j == job_id)
    }
}

/* --------- historial --------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Etl,
    Job,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    #[serde(rename = "type")]
    pub kind: RunKind,
    #[serde(deserialize_with = "flex::id_string")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub ok: bool,
    #[serde(default)]
    pub log_path: String,
    #[serde(default)]
    pub ts: String,
}

impl RunRecord {
    pub fn now(kind: RunKind, id: &str, name: &str, ok: bool, log_path: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.to_string(),
            name: name.to_string(),
            ok,
            log_path: log_path.into(),
            ts: Local::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
        }
    }
}

/* --------- documento --------- */

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Project {
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub version: Value,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub etls: Vec<EtlDoc>,
    #[serde(default)]
    pub jobs: Vec<JobDoc>,
    #[serde(default)]
    pub services: Vec<ServiceDoc>,
    #[serde(default)]
    pub runs: Vec<RunRecord>,
    /// Campos que este motor no conoce; se conservan al guardar.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Project {
    /// Busca por id y, si no hay, por nombre.
    pub fn etl(&self, key: &str) -> Option<&EtlDoc> {
        self.etls
            .iter()
            .find(|e| e.id == key)
            .or_else(|| self.etls.iter().find(|e| e.name == key))
    }

    pub fn job(&self, key: &str) -> Option<&JobDoc> {
        self.jobs
            .iter()
            .find(|j| j.id == key)
            .or_else(|| self.jobs.iter().find(|j| j.name == key))
    }

    pub fn service(&self, key: &str) -> Option<&ServiceDoc> {
        self.services
            .iter()
            .find(|s| s.id == key)
            .or_else(|| self.services.iter().find(|s| s.name == key))
    }

    pub fn from_json(text: &str) -> Result<Project> {
        serde_json::from_str(text).map_err(|e| EtlError::config(format!("proyecto inválido: {e}")))
    }
}

/// Proyecto cargado desde disco. Los lectores trabajan sobre copias; la
/// única escritura es `append_run`, serializada por el mutex.
#[derive(Debug)]
pub struct ProjectStore {
    path: PathBuf,
    project: Mutex<Project>,
}

impl ProjectStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<ProjectStore> {
        let path = path.into();
        let text = fs::read_to_string(&path)
            .map_err(|e| EtlError::io(format!("no se pudo leer {}: {e}", path.display())))?;
        let project = Project::from_json(&text)?;
        debug!(
            "proyecto {} cargado: {} etls, {} jobs, {} servicios",
            path.display(),
            project.etls.len(),
            project.jobs.len(),
            project.services.len()
        );
        Ok(ProjectStore { path, project: Mutex::new(project) })
    }

    /// Crea el archivo con `project` y lo abre.
    pub fn create(path: impl Into<PathBuf>, project: Project) -> Result<ProjectStore> {
        let path = path.into();
        write_atomic(&path, &project)?;
        Ok(ProjectStore { path, project: Mutex::new(project) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directorio del archivo de proyecto; base de las rutas relativas.
    pub fn base_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    pub fn logs(&self) -> LogLayout {
        LogLayout::for_project(&self.path)
    }

    pub fn snapshot(&self) -> Project {
        self.project.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn defaults(&self) -> Defaults {
        self.project.lock().unwrap_or_else(PoisonError::into_inner).defaults.clone()
    }

    pub fn etl(&self, key: &str) -> Option<EtlDoc> {
        self.project.lock().unwrap_or_else(PoisonError::into_inner).etl(key).cloned()
    }

    pub fn job(&self, key: &str) -> Option<JobDoc> {
        self.project.lock().unwrap_or_else(PoisonError::into_inner).job(key).cloned()
    }

    pub fn service(&self, key: &str) -> Option<ServiceDoc> {
        self.project.lock().unwrap_or_else(PoisonError::into_inner).service(key).cloned()
    }

    pub fn runs(&self) -> Vec<RunRecord> {
        self.project.lock().unwrap_or_else(PoisonError::into_inner).runs.clone()
    }

    /// Agrega al historial y persiste el documento completo. Si no se puede
    /// escribir, el historial en memoria queda como estaba.
    pub fn append_run(&self, record: RunRecord) -> Result<()> {
        let mut project = self.project.lock().unwrap_or_else(PoisonError::into_inner);
        info!("run {:?} {} ok={} -> {}", record.kind, record.id, record.ok, record.log_path);
        project.runs.push(record);
        if let Err(e) = write_atomic(&self.path, &project) {
            project.runs.pop();
            return Err(e);
        }
        Ok(())
    }
}

/// Escribe en un temporal del mismo directorio y renombra encima.
fn write_atomic(path: &Path, project: &Project) -> Result<()> {
    let text = serde_json::to_string_pretty(project)
        .map_err(|e| EtlError::io(format!("no se pudo serializar el proyecto: {e}")))?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".tmp-{}", uuid::Uuid::new_v4()));
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, text)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}
