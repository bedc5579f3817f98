pub mod auth;
pub mod config;
pub mod downloader;
pub mod integrity;
pub mod limiter;
pub mod manager;
pub mod models;
pub mod queue;
pub mod saver;
pub mod state_manager;

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::auth::{NoAuth, StaticToken, TokenProvider};
    pub use crate::config::ManagerConfig;
    pub use crate::downloader::{DownloadError, TransferOutcome};
    pub use crate::manager::{DownloadManager, ManagerError};
    pub use crate::models::{JobDescriptor, JobRecord, JobStatus};
    pub use crate::state_manager::StateManager;
}
