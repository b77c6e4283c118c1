//! Server-side modules for the mealsync sync server.

pub mod config;
pub mod reconcile;
pub mod routes;
pub mod storage;

pub use config::ServerConfig;
pub use reconcile::ReconciliationService;
pub use routes::{router, ApiError, ApiKeyEntry, ApiKeyStore, AppState, AuthUser};
pub use storage::{ServerStorage, ServerStorageError};
