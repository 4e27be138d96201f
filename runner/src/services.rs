//! Punto de extensión para los pasos `service_id` de un job.

use common::Result;

/// Arranca y detiene servicios HTTP del proyecto por id.
///
/// `stop` sobre un servicio que no está corriendo no es un error.
pub trait ServiceControl: Send + Sync {
    fn start(&self, service_id: &str) -> Result<()>;

    fn stop(&self, service_id: &str) -> Result<()>;

    fn is_running(&self, service_id: &str) -> bool;
}
