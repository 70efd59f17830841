//! Context engine module - selects what the answer service sees for a query

pub mod context_builder;

pub use context_builder::{ContextBuilder, ContextBundle, ContextItem, ContextSource, ProfileSummary};
