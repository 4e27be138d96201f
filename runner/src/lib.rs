//! Ejecución de ETLs y de jobs por etapas.

pub mod etl;
pub mod job;
pub mod services;

pub use etl::run_etl;
pub use job::{JobOutcome, JobRunner};
pub use services::ServiceControl;
