pub mod checkpoint_worker;
pub mod llm_worker;
pub use checkpoint_worker::{flush_all, CheckpointWorker, FlushReport};
pub use llm_worker::HttpAnswerService;
