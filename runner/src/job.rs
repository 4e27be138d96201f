//! Job runner: etapas en orden, pasos secuenciales o en paralelo sobre un
//! pool acotado por etapa.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use common::{JobDoc, OnError, ProjectStore, RunLog, ServiceAction, Stage, Step};
use serde::Serialize;
use serde_json::Map;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::etl::run_etl;
use crate::services::ServiceControl;

/// Resultado agregado de un job.
#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub success: bool,
    pub errors: Vec<String>,
    pub log_path: String,
}

/// Todo lo que necesita un paso; se clona hacia cada tarea.
#[derive(Clone)]
struct StepContext {
    store: Arc<ProjectStore>,
    services: Option<Arc<dyn ServiceControl>>,
    job_log: Arc<RunLog>,
    job_name: String,
    ts: String,
    active: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

#[derive(Clone)]
pub struct JobRunner {
    store: Arc<ProjectStore>,
    services: Option<Arc<dyn ServiceControl>>,
    stop: CancellationToken,
    /// Tokens de los pasos en curso, por etiqueta.
    active: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl JobRunner {
    pub fn new(store: Arc<ProjectStore>) -> Self {
        Self {
            store,
            services: None,
            stop: CancellationToken::new(),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_services(mut self, services: Arc<dyn ServiceControl>) -> Self {
        self.services = Some(services);
        self
    }

    pub fn with_stop(mut self, stop: CancellationToken) -> Self {
        self.stop = stop;
        self
    }

    /// Cancela el job y, además, cada motor registrado en este momento.
    pub fn request_stop(&self) {
        self.stop.cancel();
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        for (label, token) in active.iter() {
            info!("stop -> {label}");
            token.cancel();
        }
    }

    pub async fn run(&self, job: &JobDoc) -> common::Result<JobOutcome> {
        let name = if job.name.trim().is_empty() { job.id.clone() } else { job.name.clone() };
        let (log, ts) = self.store.logs().job_log(&name)?;
        let run_token = self.stop.child_token();
        let defaults = self.store.defaults();
        let max_parallel = job.max_parallel.unwrap_or(defaults.max_parallel);

        log.info(&format!(
            "job '{name}' inicio: {} etapas, on_error={:?}, max_parallel={max_parallel}",
            job.stages.len(),
            job.on_error
        ));
        info!("job '{name}' inicio -> {}", log.path().display());

        let ctx = StepContext {
            store: self.store.clone(),
            services: self.services.clone(),
            job_log: log.clone(),
            job_name: name.clone(),
            ts,
            active: self.active.clone(),
        };

        let mut errors: Vec<String> = Vec::new();
        for (i, stage) in job.stages.iter().enumerate() {
            if run_token.is_cancelled() {
                break;
            }
            let stage_no = i + 1;
            let stage_errors = if stage.parallel {
                let pool = stage.steps.len().min(max_parallel).max(1);
                log.info(&format!(
                    "etapa {stage_no}/{}: paralela, {} pasos, pool {pool}",
                    job.stages.len(),
                    stage.steps.len()
                ));
                run_parallel(&ctx, stage, stage_no, pool, job.on_error, &run_token).await
            } else {
                log.info(&format!(
                    "etapa {stage_no}/{}: secuencial, {} pasos",
                    job.stages.len(),
                    stage.steps.len()
                ));
                run_sequential(&ctx, stage, stage_no, job.on_error, &run_token).await
            };

            let failed = !stage_errors.is_empty();
            errors.extend(stage_errors);
            if failed && job.on_error == OnError::Stop {
                log.error(&format!("etapa {stage_no} con errores y on_error=stop: se abortan las etapas restantes"));
                run_token.cancel();
                break;
            }
        }

        if self.stop.is_cancelled() {
            log.warn("job detenido por request_stop");
            errors.push("job cancelado".to_string());
        }

        let success = errors.is_empty();
        if success {
            log.info(&format!("job '{name}' terminado ok"));
        } else {
            log.error(&format!("job '{name}' terminado con {} errores", errors.len()));
            warn!("job '{name}' terminado con {} errores", errors.len());
        }
        Ok(JobOutcome { success, errors, log_path: log.path_string() })
    }
}

async fn run_sequential(
    ctx: &StepContext,
    stage: &Stage,
    stage_no: usize,
    on_error: OnError,
    token: &CancellationToken,
) -> Vec<String> {
    let mut errors = Vec::new();
    for (j, step) in stage.steps.iter().enumerate() {
        if token.is_cancelled() {
            ctx.job_log.warn(&format!("paso {stage_no}.{} omitido: job cancelado", j + 1));
            continue;
        }
        if let Err(e) = run_step(ctx, step, format!("{stage_no}.{}", j + 1), token.child_token()).await {
            errors.push(e);
            if on_error == OnError::Stop {
                token.cancel();
            }
        }
    }
    errors
}

async fn run_parallel(
    ctx: &StepContext,
    stage: &Stage,
    stage_no: usize,
    pool: usize,
    on_error: OnError,
    token: &CancellationToken,
) -> Vec<String> {
    let sem = Arc::new(Semaphore::new(pool));
    let stage_token = token.child_token();
    let mut set = JoinSet::new();

    for (j, step) in stage.steps.iter().enumerate() {
        let ctx = ctx.clone();
        let step = step.clone();
        let sem = sem.clone();
        let step_token = stage_token.child_token();
        let label = format!("{stage_no}.{}", j + 1);
        set.spawn(async move {
            // el permiso se libera al terminar la tarea
            let Ok(_permit) = sem.acquire_owned().await else {
                return Err(format!("paso {label}: pool cerrado"));
            };
            if step_token.is_cancelled() {
                ctx.job_log.warn(&format!("paso {label} omitido: job cancelado"));
                return Ok(());
            }
            run_step(&ctx, &step, label, step_token).await
        });
    }

    let mut errors = Vec::new();
    while let Some(joined) = set.join_next().await {
        let result = joined.unwrap_or_else(|e| Err(format!("tarea de paso interrumpida: {e}")));
        if let Err(e) = result {
            errors.push(e);
            if on_error == OnError::Stop {
                // los pasos en curso observan el token y terminan como Cancelled
                stage_token.cancel();
            }
        }
    }
    errors
}

/// Ejecuta un paso; el error ya viene formateado para el resultado del job.
async fn run_step(ctx: &StepContext, step: &Step, label: String, token: CancellationToken) -> Result<(), String> {
    let log = &ctx.job_log;
    log.info(&format!("paso {label}: {} inicio", step.label()));

    let result = match step {
        Step::Etl { etl_id, overrides } => run_etl_step(ctx, etl_id, overrides, &label, token).await,
        Step::Service { service_id, action } => match &ctx.services {
            None => Err("no hay gestor de servicios disponible".to_string()),
            Some(services) => {
                let r = match action {
                    ServiceAction::Start => services.start(service_id),
                    ServiceAction::Stop => services.stop(service_id),
                };
                r.map_err(|e| e.to_string())
            }
        },
    };

    match result {
        Ok(()) => {
            log.info(&format!("paso {label}: ok"));
            Ok(())
        }
        Err(e) => {
            let msg = format!("paso {label} ({}): {e}", step.label());
            log.error(&msg);
            Err(msg)
        }
    }
}

async fn run_etl_step(
    ctx: &StepContext,
    etl_id: &str,
    overrides: &Map<String, serde_json::Value>,
    label: &str,
    token: CancellationToken,
) -> Result<(), String> {
    let etl = ctx
        .store
        .etl(etl_id)
        .ok_or_else(|| format!("el ETL '{etl_id}' no existe"))?;
    let step_log = ctx
        .store
        .logs()
        .job_step_log(&ctx.job_name, &ctx.ts, label, &etl.name)
        .map_err(|e| e.to_string())?;
    ctx.job_log.info(&format!("paso {label}: log en {}", step_log.path().display()));

    ctx.active
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(label.to_string(), token.clone());
    let result = run_etl(&etl, overrides, &ctx.store.base_dir(), step_log, token).await;
    ctx.active.lock().unwrap_or_else(PoisonError::into_inner).remove(label);

    result.map(|_| ()).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Project;
    use serde_json::json;

    fn store_with(doc: serde_json::Value) -> (tempfile::TempDir, Arc<ProjectStore>) {
        let dir = tempfile::tempdir().unwrap();
        let project: Project = serde_json::from_value(doc).unwrap();
        let store = ProjectStore::create(dir.path().join("p.fetl"), project).unwrap();
        (dir, Arc::new(store))
    }

    #[tokio::test]
    async fn paso_de_servicio_sin_gestor_falla() {
        let (_dir, store) = store_with(json!({
            "jobs": [{"id": "j", "name": "j", "stages": [{"steps": [{"service_id": "s", "action": "start"}]}]}]
        }));
        let job = store.job("j").unwrap();
        let out = JobRunner::new(store).run(&job).await.unwrap();
        assert!(!out.success);
        assert_eq!(out.errors.len(), 1);
        assert!(out.errors[0].contains("service s start"));
    }

    #[tokio::test]
    async fn etl_inexistente_es_error_del_paso() {
        let (_dir, store) = store_with(json!({
            "jobs": [{"id": "j", "name": "j", "on_error": "continue",
                      "stages": [{"steps": [{"etl_id": "nope"}]}, {"steps": []}]}]
        }));
        let job = store.job("j").unwrap();
        let out = JobRunner::new(store).run(&job).await.unwrap();
        assert_eq!(out.errors, vec!["paso 1.1 (etl nope): el ETL 'nope' no existe".to_string()]);
        assert!(std::path::Path::new(&out.log_path).exists());
    }

    #[tokio::test]
    async fn request_stop_previo_no_ejecuta_nada() {
        let (_dir, store) = store_with(json!({
            "jobs": [{"id": "j", "name": "j", "stages": [{"steps": [{"etl_id": "nope"}]}]}]
        }));
        let job = store.job("j").unwrap();
        let runner = JobRunner::new(store);
        runner.request_stop();
        let out = runner.run(&job).await.unwrap();
        assert_eq!(out.errors, vec!["job cancelado".to_string()]);
    }
}
