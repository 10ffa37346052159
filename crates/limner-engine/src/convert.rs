//! Backfills resized copies for images already on disk.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::imageops::FilterType;
use image::ImageFormat;
use serde_json::{json, Value};

use crate::store::IMAGE_EXTENSION;

const CONVERSIONS_DIR_NAME: &str = "conversions";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConvertCounts {
    pub found: u64,
    pub converted: u64,
    pub skipped: u64,
    pub errors: u64,
}

impl ConvertCounts {
    fn add(&mut self, other: ConvertCounts) {
        self.found += other.found;
        self.converted += other.converted;
        self.skipped += other.skipped;
        self.errors += other.errors;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvertReport {
    pub totals: ConvertCounts,
    pub by_entity_type: BTreeMap<String, ConvertCounts>,
}

impl ConvertReport {
    pub fn to_json(&self) -> Value {
        let by_type = self
            .by_entity_type
            .iter()
            .map(|(entity_type, counts)| (entity_type.clone(), counts_json(counts)))
            .collect::<serde_json::Map<String, Value>>();
        let mut out = counts_json(&self.totals);
        if let Some(map) = out.as_object_mut() {
            map.insert("by_entity_type".to_string(), Value::Object(by_type));
        }
        out
    }
}

fn counts_json(counts: &ConvertCounts) -> Value {
    json!({
        "found": counts.found,
        "converted": counts.converted,
        "skipped": counts.skipped,
        "errors": counts.errors,
    })
}

/// Walks `{base}/{entity_type}/{provider}/*.png` and writes square `size`
/// copies to `{conversions_root}/{size}/{entity_type}/{provider}/`.
///
/// Existing targets are skipped unless `force` is set. A single unreadable
/// image is counted as an error and the walk continues.
pub fn convert_tree(
    base: &Path,
    conversions_root: &Path,
    size: u32,
    force: bool,
) -> Result<ConvertReport> {
    let mut report = ConvertReport::default();
    for entity_dir in sorted_dirs(base)? {
        let Some(entity_type) = dir_name(&entity_dir) else {
            continue;
        };
        if entity_type.starts_with('.')
            || entity_type == CONVERSIONS_DIR_NAME
            || entity_dir == conversions_root
        {
            continue;
        }

        let mut counts = ConvertCounts::default();
        for provider_dir in sorted_dirs(&entity_dir)? {
            let Some(provider) = dir_name(&provider_dir) else {
                continue;
            };
            let target_dir = conversions_root
                .join(size.to_string())
                .join(&entity_type)
                .join(&provider);
            for source in sorted_images(&provider_dir)? {
                counts.found += 1;
                let Some(file_name) = source.file_name() else {
                    continue;
                };
                let target = target_dir.join(file_name);
                if target.exists() && !force {
                    counts.skipped += 1;
                    continue;
                }
                match resize_file(&source, &target, size) {
                    Ok(()) => counts.converted += 1,
                    Err(err) => {
                        tracing::error!(source = %source.display(), "conversion failed: {err:#}");
                        counts.errors += 1;
                    }
                }
            }
        }

        report.totals.add(counts);
        report.by_entity_type.insert(entity_type, counts);
    }
    Ok(report)
}

fn resize_file(source: &Path, target: &Path, size: u32) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let decoded =
        image::open(source).with_context(|| format!("failed to read {}", source.display()))?;
    decoded
        .resize_exact(size, size, FilterType::Lanczos3)
        .save_with_format(target, ImageFormat::Png)
        .with_context(|| format!("failed to write {}", target.display()))?;
    Ok(())
}

fn dir_name(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
}

fn sorted_dirs(root: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(root).with_context(|| format!("failed to read {}", root.display()))? {
        let path = entry?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn sorted_images(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(root).with_context(|| format!("failed to read {}", root.display()))? {
        let path = entry?.path();
        let is_png = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext == IMAGE_EXTENSION)
            .unwrap_or(false);
        if path.is_file() && is_png {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use super::convert_tree;
    use crate::store::sample_png;

    fn seed(base: &Path, relative: &str, bytes: &[u8]) -> anyhow::Result<()> {
        let path = base.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, bytes)?;
        Ok(())
    }

    #[test]
    fn converts_every_provider_image_and_skips_existing() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let base = temp.path();
        let conversions = base.join("conversions");
        let png = sample_png(40, 20);
        seed(base, "spells/dall-e/fireball.png", &png)?;
        seed(base, "spells/stability-ai/shield.png", &png)?;
        seed(base, "items/dall-e/rope.png", &png)?;
        seed(base, "items/dall-e/notes.txt", b"ignored")?;
        seed(base, ".cache/dall-e/hidden.png", &png)?;
        seed(base, "conversions/256/spells/dall-e/fireball.png", &png)?;
        seed(base, "conversions/64/items/dall-e/rope.png", b"stale")?;

        let report = convert_tree(base, &conversions, 64, false)?;
        assert_eq!(report.totals.found, 3);
        assert_eq!(report.totals.converted, 2);
        assert_eq!(report.totals.skipped, 1);
        assert_eq!(report.totals.errors, 0);
        assert_eq!(report.by_entity_type["spells"].converted, 2);
        assert!(!report.by_entity_type.contains_key(".cache"));

        let resized = image::open(conversions.join("64/spells/stability-ai/shield.png"))?;
        assert_eq!((resized.width(), resized.height()), (64, 64));
        assert_eq!(fs::read(conversions.join("64/items/dall-e/rope.png"))?, b"stale");

        let forced = convert_tree(base, &conversions, 64, true)?;
        assert_eq!(forced.totals.converted, 3);
        assert_eq!(forced.totals.skipped, 0);
        let rope = image::open(conversions.join("64/items/dall-e/rope.png"))?;
        assert_eq!(rope.width(), 64);
        Ok(())
    }

    #[test]
    fn unreadable_images_count_as_errors() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let base = temp.path();
        seed(base, "items/dall-e/broken.png", b"not a png")?;
        seed(base, "items/dall-e/good.png", &sample_png(8, 8))?;

        let report = convert_tree(base, &base.join("conversions"), 16, false)?;
        assert_eq!(report.totals.found, 2);
        assert_eq!(report.totals.errors, 1);
        assert_eq!(report.totals.converted, 1);
        assert_eq!(report.to_json()["by_entity_type"]["items"]["errors"], 1);
        Ok(())
    }
}
