//! Prompt construction from catalog records.
//!
//! Building is pure and total: malformed or missing fields degrade to empty
//! strings and never fail.

use limner_contracts::PromptConfig;
use serde_json::Value;

use crate::catalog::EntityRecord;

pub const NO_DESCRIPTION_PLACEHOLDER: &str = "NO DESCRIPTION";
pub const SOURCE_MARKER: &str = "source:";
pub const ELLIPSIS: &str = "...";

/// Prompt builder bound to one entity type's configuration and template.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    config: PromptConfig,
    template: Option<String>,
}

impl PromptBuilder {
    pub fn new(config: PromptConfig, template: Option<String>) -> Self {
        Self { config, template }
    }

    pub fn build(&self, entity: &EntityRecord, custom_text: Option<&str>) -> String {
        build_prompt(entity, &self.config, self.template.as_deref(), custom_text)
    }
}

pub fn build_prompt(
    entity: &EntityRecord,
    config: &PromptConfig,
    template: Option<&str>,
    custom_text: Option<&str>,
) -> String {
    let name = entity.get("name").and_then(Value::as_str).unwrap_or_default();

    let mut prefix = config.entity_prefix.clone();
    if config.include_category {
        let category = config
            .category_field
            .as_deref()
            .and_then(|path| extract_category(entity, path))
            .unwrap_or_default();
        prefix = collapse_whitespace(&prefix.replace("{category}", &category));
    }

    let raw_description = match custom_text.map(str::trim).filter(|text| !text.is_empty()) {
        Some(text) => text.to_string(),
        None => entity
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string(),
    };
    let description = clean_description(&raw_description, config.min_description_chars);

    let prompt = match template.filter(|value| !value.is_empty()) {
        Some(template) => template
            .replace("{entity_prefix}", &prefix)
            .replace("{entity}", name)
            .replace("{entityDescription}", &description),
        None => format!("{prefix} {name}. {description}"),
    };

    truncate_at_sentence(&prompt, config.max_length)
}

/// Walks a dotted path through nested objects. Any miss, or a non-object on the
/// way, is `None`; scalars at the end are rendered as text.
pub fn extract_category(entity: &EntityRecord, path: &str) -> Option<String> {
    let mut segments = path.split('.').filter(|segment| !segment.is_empty());
    let mut current = entity.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    match current {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Drops placeholder text and source attribution lines; anything shorter than
/// `min_chars` once cleaned is dropped entirely.
pub fn clean_description(description: &str, min_chars: usize) -> String {
    let description = description.trim();
    if description.is_empty() || description.eq_ignore_ascii_case(NO_DESCRIPTION_PLACEHOLDER) {
        return String::new();
    }

    let cleaned = description
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !is_source_line(line))
        .collect::<Vec<&str>>()
        .join(" ");

    if cleaned.chars().count() < min_chars {
        return String::new();
    }
    cleaned
}

fn is_source_line(line: &str) -> bool {
    line.get(..SOURCE_MARKER.len())
        .map(|head| head.eq_ignore_ascii_case(SOURCE_MARKER))
        .unwrap_or(false)
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<&str>>().join(" ")
}

/// Shortens `text` to at most `max_length` characters.
///
/// Prefers the last sentence terminator followed by whitespace inside the
/// window, then the last word boundary plus an ellipsis, then a hard cut plus
/// an ellipsis. The ellipsis counts toward the limit.
pub fn truncate_at_sentence(text: &str, max_length: usize) -> String {
    if text.chars().count() <= max_length {
        return text.to_string();
    }

    let window = prefix_chars(text, max_length);
    if let Some(end) = last_sentence_end(window) {
        let sentence = window[..end].trim();
        if !sentence.is_empty() {
            return sentence.to_string();
        }
    }

    let room = max_length.saturating_sub(ELLIPSIS.len());
    if room == 0 {
        return window.to_string();
    }
    let short = prefix_chars(text, room);
    let ends_on_boundary = text
        .chars()
        .nth(room)
        .map(char::is_whitespace)
        .unwrap_or(true);
    if ends_on_boundary && !short.trim().is_empty() {
        return format!("{}{ELLIPSIS}", short.trim());
    }
    if let Some(space) = short.rfind(char::is_whitespace).filter(|idx| *idx > 0) {
        let head = short[..space].trim();
        if !head.is_empty() {
            return format!("{head}{ELLIPSIS}");
        }
    }
    format!("{short}{ELLIPSIS}")
}

/// Byte offset just past the last `.`, `!` or `?` that is followed by whitespace.
fn last_sentence_end(window: &str) -> Option<usize> {
    let mut chars = window.char_indices().peekable();
    let mut found = None;
    while let Some((idx, ch)) = chars.next() {
        if matches!(ch, '.' | '!' | '?') {
            if let Some((_, next)) = chars.peek() {
                if next.is_whitespace() {
                    found = Some(idx + ch.len_utf8());
                }
            }
        }
    }
    found
}

fn prefix_chars(text: &str, count: usize) -> &str {
    match text.char_indices().nth(count) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use limner_contracts::PromptConfig;
    use serde_json::{json, Value};

    use super::{
        build_prompt, clean_description, extract_category, truncate_at_sentence, PromptBuilder,
    };
    use crate::catalog::EntityRecord;

    const TEMPLATE: &str = "Illustration of {entity_prefix} {entity}. {entityDescription}";

    fn record(value: Value) -> EntityRecord {
        value.as_object().cloned().unwrap_or_default()
    }

    fn spell_config() -> PromptConfig {
        PromptConfig {
            entity_prefix: "a D&D {category} spell effect:".to_string(),
            include_category: true,
            category_field: Some("school.name".to_string()),
            ..PromptConfig::default()
        }
    }

    #[test]
    fn builds_templated_prompt_with_nested_category() {
        let entity = record(json!({
            "name": "Fireball",
            "description": "A blast of fire",
            "school": {"name": "Evocation", "code": "EVO"}
        }));
        let config = PromptConfig {
            min_description_chars: 0,
            ..spell_config()
        };
        assert_eq!(
            build_prompt(&entity, &config, Some(TEMPLATE), None),
            "Illustration of a D&D Evocation spell effect: Fireball. A blast of fire"
        );
    }

    #[test]
    fn missing_category_leaves_no_double_spaces() {
        let entity = record(json!({
            "name": "Fireball",
            "description": "A bright streak flashes to a point you choose.",
            "school": "evocation"
        }));
        let prompt = build_prompt(&entity, &spell_config(), Some(TEMPLATE), None);
        assert_eq!(
            prompt,
            "Illustration of a D&D spell effect: Fireball. A bright streak flashes to a point you choose."
        );
    }

    #[test]
    fn falls_back_to_concatenation_without_template() {
        let entity = record(json!({"name": "Elf", "description": "Graceful forest dwellers of old"}));
        let config = PromptConfig {
            entity_prefix: "a".to_string(),
            ..PromptConfig::default()
        };
        assert_eq!(
            build_prompt(&entity, &config, None, None),
            "a Elf. Graceful forest dwellers of old"
        );
        assert_eq!(
            build_prompt(&entity, &config, Some(""), None),
            "a Elf. Graceful forest dwellers of old"
        );
    }

    #[test]
    fn custom_text_replaces_catalog_description() {
        let entity = record(json!({"name": "Sword", "description": "Normal sword"}));
        let builder = PromptBuilder::new(
            PromptConfig {
                entity_prefix: "a".to_string(),
                ..PromptConfig::default()
            },
            Some("{entity_prefix} {entity}. {entityDescription}".to_string()),
        );
        assert_eq!(
            builder.build(&entity, Some("ancient elven blade with runes")),
            "a Sword. ancient elven blade with runes"
        );
    }

    #[test]
    fn placeholder_and_short_descriptions_are_dropped() {
        let config = PromptConfig::default();
        let template = Some("{entity}: [{entityDescription}]");
        let placeholder = record(json!({"name": "Rope", "description": "no description"}));
        let short = record(json!({"name": "Rope", "description": "Hemp rope"}));
        let absent = record(json!({"name": "Rope", "description": null}));
        assert_eq!(build_prompt(&placeholder, &config, template, None), "Rope: []");
        assert_eq!(build_prompt(&short, &config, template, None), "Rope: []");
        assert_eq!(build_prompt(&absent, &config, template, None), "Rope: []");
    }

    #[test]
    fn source_lines_are_removed_case_insensitively() {
        let cleaned = clean_description(
            "A finely balanced blade.\nSource: Player's Handbook p. 149\n  SOURCE: DMG\nIt hums softly.",
            20,
        );
        assert_eq!(cleaned, "A finely balanced blade. It hums softly.");
        assert_eq!(clean_description("Source: Player's Handbook p. 149", 20), "");
    }

    #[test]
    fn category_lookup_handles_misses_and_scalars() {
        let entity = record(json!({
            "school": {"name": "Evocation", "level": 3, "tags": ["a"]},
            "flat": "value"
        }));
        assert_eq!(extract_category(&entity, "school.name").as_deref(), Some("Evocation"));
        assert_eq!(extract_category(&entity, "school.level").as_deref(), Some("3"));
        assert_eq!(extract_category(&entity, "school.tags"), None);
        assert_eq!(extract_category(&entity, "school.missing"), None);
        assert_eq!(extract_category(&entity, "flat.name"), None);
        assert_eq!(extract_category(&entity, "nothing"), None);
        assert_eq!(extract_category(&entity, ""), None);
    }

    #[test]
    fn build_is_deterministic() {
        let entity = record(json!({
            "name": "Fireball",
            "description": "A bright streak flashes to a point you choose.",
            "school": {"name": "Evocation"}
        }));
        let first = build_prompt(&entity, &spell_config(), Some(TEMPLATE), None);
        let second = build_prompt(&entity, &spell_config(), Some(TEMPLATE), None);
        assert_eq!(first, second);
    }

    #[test]
    fn truncation_prefers_sentence_boundary() {
        let text = "First sentence here. Second sentence is rather long and keeps going on.";
        assert_eq!(truncate_at_sentence(text, 40), "First sentence here.");
    }

    #[test]
    fn truncation_falls_back_to_word_boundary_with_ellipsis() {
        let text = "one two three four five six seven";
        let cut = truncate_at_sentence(text, 16);
        assert_eq!(cut, "one two three...");
        assert!(cut.chars().count() <= 16);
    }

    #[test]
    fn truncation_treats_newlines_and_tabs_as_word_boundaries() {
        assert_eq!(truncate_at_sentence("aaaa\nbbbb\ncccc", 10), "aaaa...");
        assert_eq!(truncate_at_sentence("aaaa\tbbbb\tcccc", 10), "aaaa...");
    }

    #[test]
    fn truncation_hard_cuts_without_any_boundary() {
        let text = "abcdefghijklmnopqrstuvwxyz";
        assert_eq!(truncate_at_sentence(text, 10), "abcdefg...");
        assert_eq!(truncate_at_sentence(text, 2), "ab");
    }

    #[test]
    fn truncation_leaves_short_text_alone() {
        assert_eq!(truncate_at_sentence("short. text", 100), "short. text");
    }

    #[test]
    fn truncation_never_exceeds_limit() {
        let text = "Arcane sigils glow! Do they burn? The wizard, unsure, steps back. \
                    A long tail of unpunctuated words follows without any stop at all";
        for max in 0..text.chars().count() + 5 {
            let cut = truncate_at_sentence(text, max);
            assert!(cut.chars().count() <= max, "max={max} got {cut:?}");
        }
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        let text = "Ærendil’s blade shines. Ærendil’s blade shines again and again";
        let cut = truncate_at_sentence(text, 30);
        assert_eq!(cut, "Ærendil’s blade shines.");
    }
}
