//! Núcleo de fetl: modelo de datos, DataFrame, compilador de DAG, motor de
//! ejecución, biblioteca de transformaciones, E/S y logs de ejecución.

pub mod compiler;
pub mod config;
pub mod dag;
pub mod engine;
pub mod error;
pub mod frame;
pub mod io;
pub mod project;
pub mod runlog;
pub mod transforms;
pub mod value;

pub use compiler::{compile, CompiledEtl};
pub use dag::{Dag, DagNode, EtlDoc, NodeId, NodeKind};
pub use engine::{Engine, ExecutionOutput, FanOut, Phase, ProgressEvent, ProgressListener};
pub use error::{CompileErrorKind, EtlError, ExecutionError, Result};
pub use frame::{Column, DataFrame};
pub use project::{
    Defaults, JobDoc, OnError, Project, ProjectStore, RunKind, RunRecord, ServiceAction, ServiceDoc, Stage, Step,
};
pub use runlog::{LogLayout, RunLog};
pub use value::{DataType, Value};

/* ---------------- tipos compartidos con el servicio HTTP ---------------- */

use serde::{Deserialize, Serialize};
use serde_json::Map;

/// Cuerpo de `POST /etl/run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EtlRunRequest {
    #[serde(deserialize_with = "config::flex::id_string")]
    pub etl_id: String,
    #[serde(default)]
    pub overrides: Map<String, serde_json::Value>,
}

/// Cuerpo de `POST /job/run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRunRequest {
    #[serde(deserialize_with = "config::flex::id_string")]
    pub job_id: String,
}
