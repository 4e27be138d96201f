//! Arranque y parada de los servicios HTTP de un proyecto.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use axum::Router;
use common::{EtlError, ProjectStore, Result, ServiceDoc};
use runner::ServiceControl;
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::handlers::build_router;
use crate::state::AppState;

struct Running {
    token: CancellationToken,
    addr: SocketAddr,
}

pub struct ServiceManager {
    store: Arc<ProjectStore>,
    me: Weak<ServiceManager>,
    running: Mutex<HashMap<String, Running>>,
}

impl ServiceManager {
    pub fn new(store: Arc<ProjectStore>) -> Arc<ServiceManager> {
        Arc::new_cyclic(|me| ServiceManager {
            store,
            me: me.clone(),
            running: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &Arc<ProjectStore> {
        &self.store
    }

    fn lookup(&self, service_id: &str) -> Result<ServiceDoc> {
        self.store
            .service(service_id)
            .ok_or_else(|| EtlError::config(format!("el servicio '{service_id}' no existe")))
    }

    pub fn port_for(&self, svc: &ServiceDoc) -> u16 {
        svc.port.unwrap_or_else(|| self.store.defaults().services.port)
    }

    /// Estado del servicio con su log de pedidos; los jobs que lance
    /// pueden a su vez arrancar o parar servicios de este gestor.
    pub fn app_state(&self, svc: &ServiceDoc, stop: CancellationToken) -> Result<AppState> {
        let request_log = self.store.logs().service_log(svc.display_name())?;
        let mut state = AppState::new(self.store.clone(), svc.clone(), request_log).with_stop(stop);
        if let Some(me) = self.me.upgrade() {
            state = state.with_services(me);
        }
        Ok(state)
    }

    pub fn router(&self, service_id: &str, stop: CancellationToken) -> Result<Router> {
        let svc = self.lookup(service_id)?;
        Ok(build_router(self.app_state(&svc, stop)?))
    }

    pub fn addr(&self, service_id: &str) -> Option<SocketAddr> {
        let id = self.store.service(service_id).map(|s| s.id)?;
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|r| r.addr)
    }

    pub fn running_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn stop_all(&self) {
        let drained: Vec<(String, Running)> = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (id, r) in drained {
            info!("servicio '{id}' detenido ({})", r.addr);
            r.token.cancel();
        }
    }

    /// Sirve un servicio en primer plano hasta que se cancele `shutdown`.
    pub async fn serve(&self, service_id: &str, shutdown: CancellationToken) -> Result<()> {
        let svc = self.lookup(service_id)?;
        let app = build_router(self.app_state(&svc, shutdown.clone())?);
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, self.port_for(&svc)));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| EtlError::io(format!("no se pudo escuchar en {addr}: {e}")))?;
        info!(
            "servicio '{}' escuchando en {}",
            svc.display_name(),
            listener.local_addr().unwrap_or(addr)
        );
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| EtlError::io(format!("servicio '{}': {e}", svc.id)))
    }
}

impl ServiceControl for ServiceManager {
    fn start(&self, service_id: &str) -> Result<()> {
        let svc = self.lookup(service_id)?;
        let handle = Handle::try_current()
            .map_err(|_| EtlError::config("no hay runtime tokio para arrancar servicios"))?;

        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(r) = running.get(&svc.id) {
            warn!("servicio '{}' ya estaba corriendo en {}", svc.id, r.addr);
            return Ok(());
        }

        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, self.port_for(&svc)));
        let std_listener = std::net::TcpListener::bind(addr)
            .map_err(|e| EtlError::io(format!("no se pudo escuchar en {addr}: {e}")))?;
        std_listener.set_nonblocking(true)?;
        let addr = std_listener.local_addr()?;
        let listener = {
            let _guard = handle.enter();
            TcpListener::from_std(std_listener)?
        };

        let token = CancellationToken::new();
        let app = build_router(self.app_state(&svc, token.clone())?);
        let shutdown = token.clone();
        let id = svc.id.clone();
        handle.spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = served {
                error!("servicio '{id}' terminó con error: {e}");
            }
        });

        info!("servicio '{}' arrancado en {addr}", svc.display_name());
        running.insert(svc.id.clone(), Running { token, addr });
        Ok(())
    }

    fn stop(&self, service_id: &str) -> Result<()> {
        let svc = self.lookup(service_id)?;
        let removed = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&svc.id);
        match removed {
            Some(r) => {
                r.token.cancel();
                info!("servicio '{}' detenido ({})", svc.display_name(), r.addr);
            }
            None => info!("servicio '{}' no estaba corriendo", svc.display_name()),
        }
        Ok(())
    }

    fn is_running(&self, service_id: &str) -> bool {
        self.addr(service_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Project;
    use serde_json::json;

    fn manager() -> (tempfile::TempDir, Arc<ServiceManager>) {
        let dir = tempfile::tempdir().unwrap();
        let project: Project = serde_json::from_value(json!({
            "services": [{"id": "api", "name": "API", "port": 0}]
        }))
        .unwrap();
        let store = ProjectStore::create(dir.path().join("p.fetl"), project).unwrap();
        (dir, ServiceManager::new(Arc::new(store)))
    }

    #[tokio::test]
    async fn arranca_responde_y_se_detiene() {
        let (_dir, mgr) = manager();
        mgr.start("api").unwrap();
        assert!(mgr.is_running("API"));
        let addr = mgr.addr("api").unwrap();
        assert_ne!(addr.port(), 0);

        let body: serde_json::Value = reqwest::get(format!("http://{addr}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["service"], "api");

        mgr.stop("api").unwrap();
        assert!(!mgr.is_running("api"));
    }

    #[tokio::test]
    async fn parar_un_servicio_detenido_no_es_error() {
        let (_dir, mgr) = manager();
        assert!(mgr.stop("api").is_ok());
        assert!(mgr.start("nope").is_err());
    }

    #[test]
    fn sin_runtime_no_arranca() {
        let (_dir, mgr) = manager();
        let err = mgr.start("api").unwrap_err();
        assert_eq!(err.tag(), "ConfigError");
    }
}
