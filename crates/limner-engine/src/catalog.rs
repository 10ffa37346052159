use std::collections::VecDeque;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::Client as HttpClient;
use serde_json::{Map, Value};

pub type EntityRecord = Map<String, Value>;

pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Entity types served under `{base}/lookups/...` instead of `{base}/...`.
pub const LOOKUP_ENTITY_TYPES: &[&str] = &[
    "ability_scores",
    "conditions",
    "damage_types",
    "item_properties",
    "item_types",
    "languages",
    "proficiency_types",
    "sizes",
    "skills",
    "sources",
    "spell_schools",
];

/// Accepts both `spell_schools` and `spell-schools`.
pub fn is_lookup_type(entity_type: &str) -> bool {
    let normalized = entity_type.trim().replace('-', "_");
    LOOKUP_ENTITY_TYPES.contains(&normalized.as_str())
}

/// Collection URL for an entity type. Underscores become hyphens in the path segment.
pub fn catalog_endpoint(base_url: &str, entity_type: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let segment = entity_type.replace('_', "-");
    if is_lookup_type(entity_type) {
        format!("{base}/lookups/{segment}")
    } else {
        format!("{base}/{segment}")
    }
}

/// One decoded page of `{ data: [...], meta?: {current_page, last_page} }`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CatalogPage {
    pub records: Vec<EntityRecord>,
    pub current_page: Option<u64>,
    pub last_page: Option<u64>,
}

impl CatalogPage {
    pub fn from_json(payload: &Value) -> Self {
        let records = payload
            .get("data")
            .and_then(Value::as_array)
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| row.as_object().cloned())
                    .collect()
            })
            .unwrap_or_default();
        let meta = payload.get("meta").and_then(Value::as_object);
        Self {
            records,
            current_page: meta.and_then(|meta| meta.get("current_page").and_then(Value::as_u64)),
            last_page: meta.and_then(|meta| meta.get("last_page").and_then(Value::as_u64)),
        }
    }

    /// A page without `meta` is the only page; missing counters default to the requested page.
    fn is_last(&self, requested: u64) -> bool {
        if self.current_page.is_none() && self.last_page.is_none() {
            return true;
        }
        self.current_page.unwrap_or(requested) >= self.last_page.unwrap_or(requested)
    }
}

/// Something that can hand back one catalog page.
pub trait PageSource {
    fn fetch_page(&self, entity_type: &str, page: u64, per_page: u32) -> Result<CatalogPage>;
}

/// Blocking HTTP client for the entity catalog.
pub struct CatalogClient {
    base_url: String,
    http: HttpClient,
}

impl CatalogClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .context("failed to build catalog HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn fetch(
        &self,
        entity_type: &str,
        limit: Option<usize>,
        per_page: u32,
    ) -> EntityStream<'_, Self> {
        EntityStream::new(self, entity_type, limit, per_page)
    }
}

impl PageSource for CatalogClient {
    fn fetch_page(&self, entity_type: &str, page: u64, per_page: u32) -> Result<CatalogPage> {
        let endpoint = catalog_endpoint(&self.base_url, entity_type);
        let response = self
            .http
            .get(&endpoint)
            .query(&[("page", page.to_string()), ("per_page", per_page.to_string())])
            .send()
            .with_context(|| format!("catalog request failed ({endpoint})"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("catalog request failed ({}): {endpoint}", status.as_u16());
        }
        let payload: Value = response
            .json()
            .with_context(|| format!("catalog returned invalid JSON ({endpoint})"))?;
        Ok(CatalogPage::from_json(&payload))
    }
}

/// Lazy, single-pass sequence of catalog records starting at page 1.
///
/// A failed page ends the sequence; records already yielded stay yielded.
pub struct EntityStream<'a, S: PageSource + ?Sized> {
    source: &'a S,
    entity_type: String,
    limit: Option<usize>,
    per_page: u32,
    next_page: u64,
    buffer: VecDeque<EntityRecord>,
    yielded: usize,
    exhausted: bool,
}

impl<'a, S: PageSource + ?Sized> EntityStream<'a, S> {
    pub fn new(source: &'a S, entity_type: &str, limit: Option<usize>, per_page: u32) -> Self {
        Self {
            source,
            entity_type: entity_type.to_string(),
            limit,
            per_page: per_page.max(1),
            next_page: 1,
            buffer: VecDeque::new(),
            yielded: 0,
            exhausted: false,
        }
    }

    fn limit_reached(&self) -> bool {
        self.limit.map(|limit| self.yielded >= limit).unwrap_or(false)
    }

    fn load_next_page(&mut self) {
        let page = self.next_page;
        match self
            .source
            .fetch_page(&self.entity_type, page, self.per_page)
        {
            Ok(decoded) => {
                if decoded.is_last(page) {
                    self.exhausted = true;
                }
                tracing::debug!(
                    entity_type = %self.entity_type,
                    page,
                    records = decoded.records.len(),
                    "fetched catalog page"
                );
                self.buffer.extend(decoded.records);
                self.next_page += 1;
            }
            Err(err) => {
                tracing::error!(
                    entity_type = %self.entity_type,
                    page,
                    "failed to fetch catalog page: {err:#}"
                );
                self.exhausted = true;
            }
        }
    }
}

impl<S: PageSource + ?Sized> Iterator for EntityStream<'_, S> {
    type Item = EntityRecord;

    fn next(&mut self) -> Option<Self::Item> {
        if self.limit_reached() {
            return None;
        }
        while self.buffer.is_empty() {
            if self.exhausted {
                return None;
            }
            self.load_next_page();
        }
        let record = self.buffer.pop_front()?;
        self.yielded += 1;
        Some(record)
    }
}
