use std::sync::Arc;

use common::{ProjectStore, RunLog, ServiceDoc};
use reqwest::Client;
use runner::ServiceControl;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthMode;

/// Estado compartido por los handlers de un servicio.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ProjectStore>,
    pub service: Arc<ServiceDoc>,
    pub auth: AuthMode,
    /// Log de pedidos del servicio (`services/<nombre>/<ts>.log`).
    pub request_log: Arc<RunLog>,
    /// Para los pasos `service_id` de los jobs lanzados desde `/job/run`.
    pub services: Option<Arc<dyn ServiceControl>>,
    pub http: Client,
    /// Se cancela al detener el servicio; las ejecuciones en curso lo heredan.
    pub stop: CancellationToken,
}

impl AppState {
    pub fn new(store: Arc<ProjectStore>, service: ServiceDoc, request_log: Arc<RunLog>) -> Self {
        Self {
            auth: AuthMode::for_service(&service),
            store,
            service: Arc::new(service),
            request_log,
            services: None,
            http: common::io::http::http_client(),
            stop: CancellationToken::new(),
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

    /// `lang` del servicio o, si no tiene, el de los defaults del proyecto.
    pub fn lang(&self) -> String {
        self.service
            .lang
            .clone()
            .unwrap_or_else(|| self.store.defaults().mcp.lang)
    }

    pub fn ollama_base_url(&self) -> String {
        self.store.defaults().mcp.ollama_base_url.trim_end_matches('/').to_string()
    }
}
