pub mod archive;
pub mod chunk_plan;
pub mod config;
pub mod errors;
pub mod format;
pub mod layout;
pub mod model;
pub mod orchestrator;
pub mod progress;
pub mod retry;
pub mod sink;
pub mod source;
pub mod store;
pub mod worker;

pub use config::PipelineConfig;
pub use errors::{TransferError, TransferResult};
pub use orchestrator::{Context, RunControl, TransferManager, TransferOrchestrator, TransferSummary};
