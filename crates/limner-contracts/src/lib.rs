//! Shared contracts for the limner pipeline: configuration, image locators,
//! the generation manifest, run events and run summaries.

pub mod config;
pub mod events;
pub mod locator;
pub mod runs;

pub use config::{Config, PromptConfig};
pub use locator::ImageLocator;
