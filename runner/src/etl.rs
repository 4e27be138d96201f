use std::path::Path;
use std::sync::Arc;

use common::{compile, Engine, EtlDoc, EtlError, ExecutionError, ExecutionOutput, RunLog};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

/// Compila y ejecuta un ETL escribiendo su progreso en `log`.
///
/// Lo usan tanto los pasos de un job como `POST /etl/run` y la CLI.
pub async fn run_etl(
    etl: &EtlDoc,
    overrides: &Map<String, Value>,
    base_dir: &Path,
    log: Arc<RunLog>,
    stop: CancellationToken,
) -> Result<ExecutionOutput, ExecutionError> {
    log.info(&format!("ETL '{}' (id {}) inicio", etl.name, etl.id));

    let compiled = compile(etl, overrides).map_err(|e| {
        log.error(&format!("no compila: {e}"));
        let node_id = match &e {
            EtlError::Compile { node_id, .. } => *node_id,
            _ => None,
        };
        ExecutionError::new(node_id, e)
    })?;
    for key in &compiled.ignored_overrides {
        log.warn(&format!("override '{key}' ignorada: clave mal formada"));
    }

    let engine = Engine::new()
        .with_base_dir(base_dir)
        .with_stop(stop)
        .with_listener(log.clone());

    match engine.execute(&compiled.dag).await {
        Ok(out) => {
            log.info(&format!(
                "ETL '{}' terminado: {} nodos, {} avisos",
                etl.name,
                out.order.len(),
                out.warnings.len()
            ));
            Ok(out)
        }
        Err(e) => {
            log.error(&format!("ETL '{}' falló: {e}", etl.name));
            Err(e)
        }
    }
}
