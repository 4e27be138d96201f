//! Motor de ejecución de un ETL compilado.
//!
//! Evalúa los nodos de a uno, en orden topológico. La salida de cada nodo se
//! calcula una sola vez y queda en el mapa de resultados; los sucesores la
//! leen desde ahí (mismo `Arc`). La cancelación es cooperativa: el token se
//! revisa antes de cada nodo y dentro de las lecturas largas.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{NodeOp, SinkConfig, SourceConfig};
use crate::dag::{Dag, DagNode, NodeId};
use crate::error::{EtlError, ExecutionError, Result};
use crate::frame::DataFrame;
use crate::io::sql::{with_ssl_retry, SqlDrivers};
use crate::io::{file, http};
use crate::transforms::apply_post;

/* --------- Eventos de progreso --------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    Ok,
    Fail,
    Warn,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub node_id: Option<NodeId>,
    pub phase: Phase,
    pub message: String,
}

impl ProgressEvent {
    pub fn new(node_id: Option<NodeId>, phase: Phase, message: impl Into<String>) -> Self {
        Self { node_id, phase, message: message.into() }
    }
}

pub trait ProgressListener: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);
}

impl<F> ProgressListener for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn on_event(&self, event: &ProgressEvent) {
        self(event)
    }
}

/// Reenvía cada evento a varios listeners.
#[derive(Clone, Default)]
pub struct FanOut(pub Vec<Arc<dyn ProgressListener>>);

impl ProgressListener for FanOut {
    fn on_event(&self, event: &ProgressEvent) {
        for l in &self.0 {
            l.on_event(event);
        }
    }
}

/* --------- Resultado --------- */

#[derive(Debug, Clone, Default)]
pub struct ExecutionOutput {
    pub outputs: HashMap<NodeId, Arc<DataFrame>>,
    /// Orden en que se evaluaron los nodos.
    pub order: Vec<NodeId>,
    pub warnings: Vec<String>,
}

impl ExecutionOutput {
    pub fn output(&self, id: NodeId) -> Option<&DataFrame> {
        self.outputs.get(&id).map(|df| df.as_ref())
    }
}

/* --------- Motor --------- */

#[derive(Clone)]
pub struct Engine {
    base_dir: PathBuf,
    stop: CancellationToken,
    listener: Option<Arc<dyn ProgressListener>>,
    preloaded: HashMap<NodeId, Arc<DataFrame>>,
    sql: SqlDrivers,
    http: Client,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("base_dir", &self.base_dir)
            .field("cancelled", &self.stop.is_cancelled())
            .field("preloaded", &self.preloaded.keys().collect::<Vec<_>>())
            .field("sql", &self.sql)
            .finish()
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            base_dir: PathBuf::from("."),
            stop: CancellationToken::new(),
            listener: None,
            preloaded: HashMap::new(),
            sql: SqlDrivers::default(),
            http: http::http_client(),
        }
    }

    /// Directorio contra el que se resuelven las rutas relativas.
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = dir.into();
        self
    }

    pub fn with_stop(mut self, stop: CancellationToken) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn ProgressListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// El nodo origen `id` usa este DataFrame en lugar de leer.
    pub fn with_preloaded(mut self, id: NodeId, df: DataFrame) -> Self {
        self.preloaded.insert(id, Arc::new(df));
        self
    }

    pub fn with_sql_drivers(mut self, drivers: SqlDrivers) -> Self {
        self.sql = drivers;
        self
    }

    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http = client;
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    fn emit(&self, node_id: Option<NodeId>, phase: Phase, message: impl Into<String>) {
        if let Some(l) = &self.listener {
            l.on_event(&ProgressEvent::new(node_id, phase, message));
        }
    }

    pub async fn execute(&self, dag: &Dag) -> Result<ExecutionOutput, ExecutionError> {
        if dag.sources().is_empty() {
            let err = ExecutionError::new(None, EtlError::NoSource);
            self.emit(None, Phase::Fail, err.to_string());
            return Err(err);
        }

        let mut out = ExecutionOutput::default();
        for id in dag.topo_order() {
            if self.stop.is_cancelled() {
                self.emit(Some(id), Phase::Fail, "ejecución cancelada");
                return Err(ExecutionError::new(Some(id), EtlError::Cancelled));
            }
            let Some(node) = dag.node(id) else { continue };

            self.emit(Some(id), Phase::Start, format!("inicio {}", node.label()));
            let mut warnings = Vec::new();
            let result = self.eval_node(dag, node, &out.outputs, &mut warnings).await;
            for w in &warnings {
                self.emit(Some(id), Phase::Warn, w.clone());
            }
            out.warnings.extend(warnings.into_iter().map(|w| format!("nodo {id}: {w}")));

            match result {
                Ok(df) => {
                    self.emit(Some(id), Phase::Ok, format!("ok {} ({} filas)", node.label(), df.height()));
                    out.outputs.insert(id, Arc::new(df));
                    out.order.push(id);
                }
                Err(e) => {
                    self.emit(Some(id), Phase::Fail, format!("{} falló: {e}", node.label()));
                    return Err(ExecutionError::new(Some(id), e));
                }
            }
        }
        Ok(out)
    }

    /// Entradas de un nodo en orden de llegada de las aristas.
    fn inputs<'a>(
        dag: &Dag,
        node: &DagNode,
        outputs: &'a HashMap<NodeId, Arc<DataFrame>>,
    ) -> Result<Vec<&'a DataFrame>> {
        let inputs: Vec<&DataFrame> = dag
            .predecessors(node.id)
            .iter()
            .filter_map(|p| outputs.get(p).map(|df| df.as_ref()))
            .collect();
        if inputs.is_empty() {
            return Err(EtlError::config(format!("el nodo {} no tiene entrada", node.label())));
        }
        Ok(inputs)
    }

    async fn eval_node(
        &self,
        dag: &Dag,
        node: &DagNode,
        outputs: &HashMap<NodeId, Arc<DataFrame>>,
        warnings: &mut Vec<String>,
    ) -> Result<DataFrame> {
        match &node.op {
            NodeOp::Source(src) => {
                let df = match self.preloaded.get(&node.id) {
                    Some(df) => {
                        debug!("nodo {}: usando DataFrame precargado", node.id);
                        df.as_ref().clone()
                    }
                    None => self.read_source(src).await?,
                };
                apply_post(&df, &node.post)
            }
            NodeOp::Transform(op) => {
                let inputs = Self::inputs(dag, node, outputs)?;
                let df = op.apply(&inputs, warnings)?;
                apply_post(&df, &node.post)
            }
            NodeOp::Destination(sink) => {
                let inputs = Self::inputs(dag, node, outputs)?;
                let df = apply_post(inputs[0], &node.post)?;
                if self.stop.is_cancelled() {
                    return Err(EtlError::Cancelled);
                }
                let written = self.write_sink(sink, &df).await?;
                debug!("nodo {}: {written} filas escritas", node.id);
                Ok(df)
            }
        }
    }

    async fn read_source(&self, src: &SourceConfig) -> Result<DataFrame> {
        match src {
            SourceConfig::File(f) => {
                let f = f.clone();
                let base = self.base_dir.clone();
                let stop = self.stop.clone();
                blocking(move || file::read_source(&f, &base, &stop)).await
            }
            SourceConfig::Database(db) => {
                let query = db
                    .query
                    .clone()
                    .ok_or_else(|| EtlError::config("origen database sin 'query'"))?;
                let conn = db.conn.resolved(&self.base_dir);
                let driver = self.sql.get(&conn.driver_name())?;
                blocking(move || with_ssl_retry(&conn, |c| driver.query(c, &query))).await
            }
            SourceConfig::Api(api) => http::fetch(&self.http, api, &self.stop).await,
        }
    }

    async fn write_sink(&self, sink: &SinkConfig, df: &DataFrame) -> Result<usize> {
        match sink {
            SinkConfig::File(f) => {
                let f = f.clone();
                let base = self.base_dir.clone();
                let df = df.clone();
                blocking(move || file::write_sink(&f, &df, &base)).await
            }
            SinkConfig::Database(db) => {
                let table = db
                    .table
                    .clone()
                    .ok_or_else(|| EtlError::config("destino database sin 'table'"))?;
                let conn = db.conn.resolved(&self.base_dir);
                let driver = self.sql.get(&conn.driver_name())?;
                let if_exists = db.if_exists;
                let df = df.clone();
                blocking(move || with_ssl_retry(&conn, |c| driver.write(c, &table, &df, if_exists))).await
            }
            SinkConfig::Api(api) => http::post_batches(&self.http, api, df, &self.stop).await,
        }
    }
}

/// Corre I/O bloqueante fuera del runtime async.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EtlError::io(format!("tarea de I/O interrumpida: {e}")))?
}
