//! Seam to the external answer generator

use crate::context_engine::ContextBundle;
use crate::error::ServiceError;
use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedAnswer {
    pub text: String,
    /// Self-reported confidence, if the service gives one
    pub confidence: Option<f32>,
}

#[async_trait]
pub trait AnswerService: Send + Sync {
    async fn generate(&self, query: &str, context: &ContextBundle) -> Result<GeneratedAnswer, ServiceError>;

    /// Recorded as the `source` of knowledge entries written back from this service.
    fn source_tag(&self) -> String;
}
