//! Runtime HTTP de fetl: expone ETLs y jobs de un proyecto con autenticación
//! opcional y un pass-through al LLM local.

pub mod auth;
pub mod handlers;
pub mod manager;
pub mod state;

pub use auth::AuthMode;
pub use handlers::build_router;
pub use manager::ServiceManager;
pub use state::AppState;
