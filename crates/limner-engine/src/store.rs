//! Artifact storage: canonical image copies, resized conversions and the
//! generation manifest.
//!
//! Layout:
//! - `{base}/{entity_type}/{provider}/{slug}.png`
//! - `{conversions_root}/{size}/{entity_type}/{provider}/{slug}.png`

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::imageops::FilterType;
use image::ImageFormat;
use limner_contracts::config::OutputConfig;
use limner_contracts::runs::GenerationManifest;
use limner_contracts::ImageLocator;
use reqwest::blocking::Client as HttpClient;
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const IMAGE_EXTENSION: &str = "png";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlugError {
    #[error("slug is missing")]
    Missing,
    #[error("slug is the literal string \"null\"")]
    LiteralNull,
    #[error("slug is empty")]
    Empty,
    #[error("slug {0:?} must not contain path components")]
    PathComponents(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid slug: {0}")]
    InvalidSlug(#[from] SlugError),
    #[error("invalid path segment {0:?}")]
    InvalidSegment(String),
    #[error("image download failed ({url})")]
    Download {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("image download failed ({status}): {url}")]
    Status { url: String, status: u16 },
    #[error("embedded image payload is not valid base64")]
    Payload(#[from] base64::DecodeError),
    #[error("image conversion failed")]
    Image(#[from] image::ImageError),
    #[error("failed to write {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Accepts only a non-empty slug that is its own file name.
pub fn validate_slug(slug: Option<&str>) -> Result<&str, SlugError> {
    let slug = slug.ok_or(SlugError::Missing)?;
    if slug == "null" {
        return Err(SlugError::LiteralNull);
    }
    if slug.trim().is_empty() {
        return Err(SlugError::Empty);
    }
    if !is_single_component(slug) {
        return Err(SlugError::PathComponents(slug.to_string()));
    }
    Ok(slug)
}

fn is_single_component(value: &str) -> bool {
    !value.contains('\\') && Path::new(value).file_name() == Some(OsStr::new(value))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub path: PathBuf,
    pub conversions: Vec<PathBuf>,
    pub sha256: String,
    pub bytes: usize,
}

#[derive(Debug, Clone)]
struct ConversionPlan {
    root: PathBuf,
    sizes: Vec<u32>,
}

pub struct ArtifactStore {
    base_path: PathBuf,
    conversions: Option<ConversionPlan>,
    http: HttpClient,
    manifest: GenerationManifest,
}

impl ArtifactStore {
    pub fn from_config(output: &OutputConfig) -> anyhow::Result<Self> {
        let conversions = output.conversions.is_active().then(|| {
            (
                output.conversions.root(&output.base_path),
                output.conversions.sizes.clone(),
            )
        });
        Self::new(
            &output.base_path,
            conversions,
            Duration::from_secs(output.timeout),
        )
    }

    /// `conversions` is `(root, sizes)`; `None` or an empty size list disables them.
    pub fn new(
        base_path: &Path,
        conversions: Option<(PathBuf, Vec<u32>)>,
        download_timeout: Duration,
    ) -> anyhow::Result<Self> {
        fs::create_dir_all(base_path)
            .with_context(|| format!("failed to create {}", base_path.display()))?;
        let http = HttpClient::builder()
            .timeout(download_timeout)
            .build()
            .context("failed to build image download client")?;
        let conversions = conversions
            .filter(|(_, sizes)| !sizes.is_empty())
            .map(|(root, sizes)| ConversionPlan { root, sizes });
        Ok(Self {
            base_path: base_path.to_path_buf(),
            conversions,
            http,
            manifest: GenerationManifest::in_dir(base_path),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn manifest(&self) -> &GenerationManifest {
        &self.manifest
    }

    pub fn canonical_path(&self, entity_type: &str, provider: &str, slug: &str) -> PathBuf {
        self.base_path
            .join(entity_type)
            .join(provider)
            .join(format!("{slug}.{IMAGE_EXTENSION}"))
    }

    pub fn conversion_paths(&self, entity_type: &str, provider: &str, slug: &str) -> Vec<PathBuf> {
        let Some(plan) = &self.conversions else {
            return Vec::new();
        };
        plan.sizes
            .iter()
            .map(|size| {
                plan.root
                    .join(size.to_string())
                    .join(entity_type)
                    .join(provider)
                    .join(format!("{slug}.{IMAGE_EXTENSION}"))
            })
            .collect()
    }

    /// Validates the identity, materializes the image bytes and writes the
    /// canonical copy plus any conversions. Existing files are overwritten.
    pub fn store(
        &self,
        locator: &ImageLocator,
        entity_type: &str,
        slug: Option<&str>,
        provider: &str,
    ) -> Result<StoredArtifact, StoreError> {
        let slug = validate_slug(slug)?;
        for segment in [entity_type, provider] {
            if segment.trim().is_empty() || !is_single_component(segment) {
                return Err(StoreError::InvalidSegment(segment.to_string()));
            }
        }

        let bytes = self.materialize(locator)?;
        let path = self.canonical_path(entity_type, provider, slug);
        write_bytes(&path, &bytes)?;
        tracing::info!(entity_type, slug, provider, path = %path.display(), "saved image");

        let mut conversions = Vec::new();
        let targets = self.conversion_paths(entity_type, provider, slug);
        if let Some(plan) = &self.conversions {
            let decoded = image::load_from_memory(&bytes)?;
            for (size, target) in plan.sizes.iter().zip(targets) {
                ensure_parent(&target)?;
                decoded
                    .resize_exact(*size, *size, FilterType::Lanczos3)
                    .save_with_format(&target, ImageFormat::Png)?;
                tracing::debug!(size, path = %target.display(), "saved conversion");
                conversions.push(target);
            }
        }

        Ok(StoredArtifact {
            path,
            conversions,
            sha256: hex::encode(Sha256::digest(&bytes)),
            bytes: bytes.len(),
        })
    }

    pub fn record_result(
        &self,
        entity_type: &str,
        slug: &str,
        path: &str,
        success: bool,
        error: Option<&str>,
    ) -> anyhow::Result<()> {
        self.manifest
            .record_result(entity_type, slug, path, success, error)
    }

    pub fn is_already_generated(&self, entity_type: &str, slug: &str) -> anyhow::Result<bool> {
        self.manifest.is_already_generated(entity_type, slug)
    }

    pub fn count_generated(&self, entity_type: Option<&str>) -> anyhow::Result<usize> {
        self.manifest.count_generated(entity_type)
    }

    fn materialize(&self, locator: &ImageLocator) -> Result<Vec<u8>, StoreError> {
        match locator {
            ImageLocator::Embedded { payload, .. } => {
                let compact: String = payload.split_whitespace().collect();
                Ok(BASE64.decode(compact.as_bytes())?)
            }
            ImageLocator::RemoteUrl(url) => self.download(url),
        }
    }

    fn download(&self, url: &str) -> Result<Vec<u8>, StoreError> {
        let response = self
            .http
            .get(url)
            .send()
            .map_err(|source| StoreError::Download {
                url: url.to_string(),
                source,
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let bytes = response.bytes().map_err(|source| StoreError::Download {
            url: url.to_string(),
            source,
        })?;
        Ok(bytes.to_vec())
    }
}

fn ensure_parent(path: &Path) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| StoreError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

fn write_bytes(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    ensure_parent(path)?;
    fs::write(path, bytes).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
pub(crate) fn sample_png(width: u32, height: u32) -> Vec<u8> {
    let image = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    });
    let mut out = std::io::Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Png)
        .expect("encode sample png");
    out.into_inner()
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::time::Duration;

    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use limner_contracts::ImageLocator;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, ResponseTemplate};

    use super::{sample_png, validate_slug, ArtifactStore, SlugError, StoreError};
    use crate::test_support::MockHttp;

    fn embedded(width: u32, height: u32) -> ImageLocator {
        ImageLocator::embedded_png(BASE64.encode(sample_png(width, height)))
    }

    fn count_files(root: &Path) -> usize {
        let Ok(entries) = fs::read_dir(root) else {
            return 0;
        };
        entries
            .flatten()
            .map(|entry| {
                let path = entry.path();
                if path.is_dir() {
                    count_files(&path)
                } else {
                    1
                }
            })
            .sum()
    }

    #[test]
    fn slug_validation_distinguishes_each_rejection() {
        assert_eq!(validate_slug(None), Err(SlugError::Missing));
        assert_eq!(validate_slug(Some("null")), Err(SlugError::LiteralNull));
        assert_eq!(validate_slug(Some("")), Err(SlugError::Empty));
        assert_eq!(
            validate_slug(Some("../../etc/passwd")),
            Err(SlugError::PathComponents("../../etc/passwd".to_string()))
        );
        assert!(matches!(validate_slug(Some("..")), Err(SlugError::PathComponents(_))));
        assert!(matches!(validate_slug(Some("a\\b")), Err(SlugError::PathComponents(_))));
        assert_eq!(validate_slug(Some("fireball")), Ok("fireball"));
    }

    #[test]
    fn rejected_slugs_write_nothing() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let base = temp.path().join("out");
        let store = ArtifactStore::new(
            &base,
            Some((base.join("conversions"), vec![256])),
            Duration::from_secs(5),
        )?;
        let locator = embedded(8, 8);

        for slug in [None, Some("null"), Some(""), Some("../../etc/passwd")] {
            let err = store.store(&locator, "spells", slug, "dall-e").unwrap_err();
            assert!(matches!(err, StoreError::InvalidSlug(_)), "{slug:?}: {err}");
        }
        assert_eq!(count_files(&base), 0);
        assert!(!temp.path().join("etc").exists());
        Ok(())
    }

    #[test]
    fn embedded_image_is_written_with_two_conversions() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let base = temp.path().join("out");
        let conversions_root = base.join("conversions");
        let store = ArtifactStore::new(
            &base,
            Some((conversions_root.clone(), vec![256, 512])),
            Duration::from_secs(5),
        )?;

        let stored = store.store(&embedded(64, 32), "spells", Some("fireball"), "stability-ai")?;
        assert_eq!(stored.path, base.join("spells/stability-ai/fireball.png"));
        assert_eq!(fs::read(&stored.path)?, sample_png(64, 32));
        assert_eq!(stored.sha256.len(), 64);

        assert_eq!(count_files(&conversions_root), 2);
        for size in [256u32, 512] {
            let path = conversions_root.join(format!("{size}/spells/stability-ai/fireball.png"));
            assert!(stored.conversions.contains(&path));
            let converted = image::open(&path)?;
            assert_eq!((converted.width(), converted.height()), (size, size));
        }
        Ok(())
    }

    #[test]
    fn disabled_conversions_write_only_canonical_copy() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ArtifactStore::new(
            temp.path(),
            Some((temp.path().join("conversions"), Vec::new())),
            Duration::from_secs(5),
        )?;
        let stored = store.store(&embedded(8, 8), "items", Some("rope"), "dall-e")?;
        assert!(stored.conversions.is_empty());
        assert!(!temp.path().join("conversions").exists());
        assert_eq!(count_files(temp.path()), 1);
        Ok(())
    }

    #[test]
    fn existing_canonical_file_is_overwritten() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ArtifactStore::new(temp.path(), None, Duration::from_secs(5))?;
        let target = store.canonical_path("items", "dall-e", "rope");
        fs::create_dir_all(target.parent().unwrap())?;
        fs::write(&target, b"stale")?;

        store.store(&embedded(4, 4), "items", Some("rope"), "dall-e")?;
        assert_eq!(fs::read(&target)?, sample_png(4, 4));
        Ok(())
    }

    #[test]
    fn remote_locator_is_downloaded() -> anyhow::Result<()> {
        let png = sample_png(16, 16);
        let server = MockHttp::start()?;
        server.mount(
            Mock::given(method("GET"))
                .and(path("/img.png"))
                .respond_with(
                    ResponseTemplate::new(200)
                        .insert_header("content-type", "image/png")
                        .set_body_bytes(png.clone()),
                ),
        );
        let temp = tempfile::tempdir()?;
        let store = ArtifactStore::new(temp.path(), None, Duration::from_secs(5))?;

        let stored = store.store(
            &ImageLocator::RemoteUrl(server.url("/img.png")),
            "monsters",
            Some("goblin"),
            "dall-e",
        )?;
        assert_eq!(fs::read(stored.path)?, png);

        let err = store
            .store(
                &ImageLocator::RemoteUrl(server.url("/expired.png")),
                "monsters",
                Some("orc"),
                "dall-e",
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::Status { status: 404, .. }));
        assert!(!store.canonical_path("monsters", "dall-e", "orc").exists());
        Ok(())
    }

    #[test]
    fn malformed_payload_is_rejected_before_writing() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ArtifactStore::new(temp.path(), None, Duration::from_secs(5))?;
        let err = store
            .store(&ImageLocator::embedded_png("***"), "items", Some("rope"), "dall-e")
            .unwrap_err();
        assert!(matches!(err, StoreError::Payload(_)));
        assert_eq!(count_files(temp.path()), 0);
        Ok(())
    }

    #[test]
    fn manifest_operations_go_through_the_store() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ArtifactStore::new(temp.path(), None, Duration::from_secs(5))?;
        store.record_result("spells", "fireball", "spells/dall-e/fireball.png", true, None)?;
        store.record_result("spells", "shield", "", false, Some("boom"))?;
        assert!(store.is_already_generated("spells", "fireball")?);
        assert!(!store.is_already_generated("spells", "shield")?);
        assert_eq!(store.count_generated(Some("spells"))?, 1);
        assert!(store.manifest().path().ends_with(".manifest.json"));
        Ok(())
    }
}
