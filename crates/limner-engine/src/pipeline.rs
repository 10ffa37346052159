//! Batch orchestration: catalog → prompt → provider → store → manifest.
//!
//! A failure for one entity is recorded and the batch moves on; only
//! infrastructure failures (manifest or run log unwritable, unknown slug
//! filter) abort a run.

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{SecondsFormat, Utc};
use limner_contracts::config::{Config, PromptsConfig};
use limner_contracts::events::{new_run_id, EventPayload, EventWriter};
use limner_contracts::runs::{write_summary, RunSummary};
use serde_json::{json, Value};

use crate::catalog::{CatalogClient, EntityRecord, EntityStream, PageSource, DEFAULT_PAGE_SIZE};
use crate::prompt::PromptBuilder;
use crate::providers::{create_provider, retry, ImageProvider};
use crate::store::{validate_slug, ArtifactStore, StoredArtifact};

/// How many catalog records a slug lookup scans before giving up.
pub const SLUG_SCAN_LIMIT: usize = 1000;
pub const RUNS_DIR_NAME: &str = ".runs";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub limit: Option<usize>,
    pub slug: Option<String>,
    pub dry_run: bool,
    pub force_regenerate: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchSummary {
    pub run_id: String,
    pub total: u64,
    pub succeeded: u64,
    pub skipped: u64,
    pub failed: u64,
    /// Provider spend for the images produced; zero for dry runs.
    pub estimated_cost: f64,
    pub run_dir: PathBuf,
}

enum Outcome {
    Previewed,
    Stored(StoredArtifact),
}

/// `slug`, or a lookup record's `code` when it has no slug.
pub fn entity_identifier(entity: &EntityRecord) -> Option<&str> {
    ["slug", "code"]
        .into_iter()
        .find_map(|key| entity.get(key).and_then(Value::as_str))
}

pub struct Pipeline {
    source: Box<dyn PageSource>,
    provider: Option<Box<dyn ImageProvider>>,
    store: ArtifactStore,
    prompts: PromptsConfig,
    batch_delay: Duration,
    cost_per_image: f64,
    runs_dir: PathBuf,
}

impl Pipeline {
    pub fn new(
        source: Box<dyn PageSource>,
        provider: Option<Box<dyn ImageProvider>>,
        store: ArtifactStore,
        prompts: PromptsConfig,
        batch_delay: Duration,
    ) -> Self {
        let runs_dir = store.base_path().join(RUNS_DIR_NAME);
        Self {
            source,
            provider,
            store,
            prompts,
            batch_delay,
            cost_per_image: 0.0,
            runs_dir,
        }
    }

    /// Wires the catalog client, artifact store and configured provider.
    /// With `with_provider` false no credentials are needed (dry runs).
    pub fn from_config(config: &Config, with_provider: bool) -> Result<Self> {
        let source = CatalogClient::new(&config.api.base_url, Duration::from_secs(config.api.timeout))?;
        let store = ArtifactStore::from_config(&config.output)?;
        let provider = if with_provider {
            let name = config.image_generation.provider.as_str();
            tracing::info!(provider = name, "using image provider");
            Some(create_provider(name, config)?)
        } else {
            None
        };
        Ok(Self::new(
            Box::new(source),
            provider,
            store,
            config.prompts.clone(),
            retry::seconds(config.generation.batch_delay),
        )
        .with_cost_per_image(config.generation.cost_per_image))
    }

    /// Price of one generated image, used for the run's cost estimate.
    pub fn with_cost_per_image(mut self, cost_per_image: f64) -> Self {
        self.cost_per_image = cost_per_image.max(0.0);
        self
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn provider_name(&self) -> Option<&str> {
        self.provider.as_deref().map(|provider| provider.name())
    }

    pub fn prompt_builder(&self, entity_type: &str) -> PromptBuilder {
        PromptBuilder::new(
            self.prompts.for_entity_type(entity_type),
            self.prompts.template_for(entity_type),
        )
    }

    fn fetch(&self, entity_type: &str, limit: Option<usize>) -> EntityStream<'_, dyn PageSource> {
        EntityStream::new(self.source.as_ref(), entity_type, limit, DEFAULT_PAGE_SIZE)
    }

    pub fn run(&self, entity_type: &str, options: &RunOptions) -> Result<BatchSummary> {
        if !options.dry_run && self.provider.is_none() {
            bail!("no image provider configured for a non-dry run");
        }

        let run_id = new_run_id();
        let run_dir = self.runs_dir.join(&run_id);
        let events = EventWriter::new(run_dir.join("events.jsonl"), run_id.as_str());
        let started_at = now_utc_iso();
        events.emit(
            "run_started",
            payload(json!({
                "entity_type": entity_type,
                "provider": self.provider_name(),
                "limit": options.limit,
                "slug": options.slug,
                "dry_run": options.dry_run,
                "force_regenerate": options.force_regenerate,
            })),
        )?;
        tracing::info!(entity_type, run_id = %run_id, "fetching entities");

        let entities: Box<dyn Iterator<Item = EntityRecord> + '_> = match options.slug.as_deref() {
            Some(wanted) => {
                let wanted = wanted.to_string();
                Box::new(
                    self.fetch(entity_type, Some(SLUG_SCAN_LIMIT))
                        .filter(move |entity| entity_identifier(entity) == Some(wanted.as_str())),
                )
            }
            None => Box::new(self.fetch(entity_type, options.limit)),
        };
        let mut entities = entities.peekable();

        let mut summary = BatchSummary {
            run_id: run_id.clone(),
            run_dir: run_dir.clone(),
            ..BatchSummary::default()
        };
        while let Some(entity) = entities.next() {
            summary.total += 1;
            let identifier = entity_identifier(&entity);
            let label = identifier.unwrap_or("<missing>");
            let name = entity.get("name").and_then(Value::as_str).unwrap_or(label);
            tracing::info!(index = summary.total, slug = label, "processing {name}");

            if !options.force_regenerate {
                if let Some(slug) = identifier {
                    if self.store.is_already_generated(entity_type, slug)? {
                        tracing::info!(slug, "skipping, already generated");
                        summary.skipped += 1;
                        events.emit("entity_skipped", payload(json!({"slug": slug})))?;
                        continue;
                    }
                }
            }

            match self.process(entity_type, &entity, identifier, None, options.dry_run) {
                Ok(Outcome::Previewed) => summary.succeeded += 1,
                Ok(Outcome::Stored(artifact)) => {
                    summary.succeeded += 1;
                    events.emit(
                        "artifact_stored",
                        payload(json!({
                            "slug": label,
                            "path": artifact.path.display().to_string(),
                            "conversions": artifact
                                .conversions
                                .iter()
                                .map(|path| path.display().to_string())
                                .collect::<Vec<String>>(),
                            "sha256": artifact.sha256,
                        })),
                    )?;
                    if entities.peek().is_some() && !self.batch_delay.is_zero() {
                        thread::sleep(self.batch_delay);
                    }
                }
                Err(err) => {
                    summary.failed += 1;
                    let message = format!("{err:#}");
                    tracing::error!(slug = label, "generation failed: {message}");
                    self.record_failure(entity_type, identifier, &message)?;
                    events.emit(
                        "entity_failed",
                        payload(json!({"slug": identifier, "error": message})),
                    )?;
                }
            }
        }

        if let Some(wanted) = options.slug.as_deref() {
            if summary.total == 0 {
                bail!("entity with slug '{wanted}' not found in {entity_type}");
            }
        }

        if !options.dry_run {
            summary.estimated_cost = summary.succeeded as f64 * self.cost_per_image;
        }
        events.emit(
            "run_finished",
            payload(json!({
                "total": summary.total,
                "succeeded": summary.succeeded,
                "skipped": summary.skipped,
                "failed": summary.failed,
                "estimated_cost": summary.estimated_cost,
            })),
        )?;
        write_summary(
            &run_dir.join("summary.json"),
            &RunSummary {
                run_id,
                entity_type: entity_type.to_string(),
                provider: self.provider_name().map(str::to_string),
                started_at,
                finished_at: now_utc_iso(),
                total: summary.total,
                succeeded: summary.succeeded,
                skipped: summary.skipped,
                failed: summary.failed,
                estimated_cost: summary.estimated_cost,
                dry_run: options.dry_run,
            },
        )?;
        tracing::info!(
            total = summary.total,
            succeeded = summary.succeeded,
            skipped = summary.skipped,
            failed = summary.failed,
            estimated_cost = summary.estimated_cost,
            "run finished"
        );
        Ok(summary)
    }

    /// Regenerates one entity regardless of the manifest, optionally replacing
    /// its catalog description with `custom_text`.
    pub fn generate_one(
        &self,
        entity_type: &str,
        slug: &str,
        custom_text: Option<&str>,
    ) -> Result<StoredArtifact> {
        let entity = self
            .fetch(entity_type, Some(SLUG_SCAN_LIMIT))
            .find(|entity| entity_identifier(entity) == Some(slug))
            .with_context(|| format!("entity with slug '{slug}' not found in {entity_type}"))?;

        match self.process(entity_type, &entity, Some(slug), custom_text, false) {
            Ok(Outcome::Stored(artifact)) => Ok(artifact),
            Ok(Outcome::Previewed) => bail!("generation for '{slug}' produced no artifact"),
            Err(err) => {
                self.record_failure(entity_type, Some(slug), &format!("{err:#}"))?;
                Err(err)
            }
        }
    }

    fn process(
        &self,
        entity_type: &str,
        entity: &EntityRecord,
        identifier: Option<&str>,
        custom_text: Option<&str>,
        dry_run: bool,
    ) -> Result<Outcome> {
        let prompt = self.prompt_builder(entity_type).build(entity, custom_text);
        tracing::debug!(prompt = %prompt, "built prompt");
        if dry_run {
            tracing::info!(slug = identifier.unwrap_or("<missing>"), "dry run, not generating");
            return Ok(Outcome::Previewed);
        }

        let slug = validate_slug(identifier)?;
        let Some(provider) = self.provider.as_deref() else {
            bail!("no image provider configured");
        };
        let locator = provider.generate(&prompt, None)?;
        tracing::debug!(locator = %locator.describe(), "provider returned image");
        let artifact = self
            .store
            .store(&locator, entity_type, Some(slug), provider.name())?;
        self.store.record_result(
            entity_type,
            slug,
            &artifact.path.display().to_string(),
            true,
            None,
        )?;
        tracing::info!(slug, path = %artifact.path.display(), "generated");
        Ok(Outcome::Stored(artifact))
    }

    // An entity with no usable identifier has no manifest key; it is only logged.
    fn record_failure(&self, entity_type: &str, identifier: Option<&str>, message: &str) -> Result<()> {
        match identifier {
            Some(slug) => self
                .store
                .record_result(entity_type, slug, "", false, Some(message)),
            None => Ok(()),
        }
    }
}

fn payload(value: Value) -> EventPayload {
    match value {
        Value::Object(map) => map,
        _ => EventPayload::new(),
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
