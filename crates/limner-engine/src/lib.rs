//! Generation pipeline: catalog paging, prompt building, image providers,
//! artifact storage and batch orchestration.

pub mod catalog;
pub mod convert;
pub mod pipeline;
pub mod prompt;
pub mod providers;
pub mod store;

#[cfg(test)]
mod test_support;

pub use catalog::{CatalogClient, EntityRecord, EntityStream, PageSource};
pub use convert::{convert_tree, ConvertCounts, ConvertReport};
pub use pipeline::{BatchSummary, Pipeline, RunOptions};
pub use prompt::PromptBuilder;
pub use providers::{available_providers, create_provider, ImageProvider, ProviderKind, RetryPolicy};
pub use store::{ArtifactStore, SlugError, StoreError, StoredArtifact};
