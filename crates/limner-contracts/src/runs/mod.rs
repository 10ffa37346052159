pub mod manifest;
pub mod summary;

pub use manifest::{GenerationManifest, ManifestDocument, ManifestEntry};
pub use summary::{write_summary, RunSummary};
