//! Composable entity extraction.
//!
//! Each [`ExtractionStrategy`] reports candidate spans with a confidence. The
//! [`EntityExtractor`] runs every strategy, resolves overlapping candidates, and applies the job's
//! confidence threshold and type filter. Overlaps are resolved greedily in priority order:
//! higher confidence first, then the narrower span, then the earlier start, then the type tag.
//! A candidate that intersects an already accepted span is dropped.

use regex::Regex;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// Candidate span with character offsets relative to the scanned text.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityCandidate {
    /// Type tag.
    pub entity_type: String,
    /// Matched text.
    pub text: String,
    /// Start offset, in characters.
    pub start: usize,
    /// Exclusive end offset, in characters.
    pub end: usize,
    /// Confidence in `[0, 1]`.
    pub confidence: f32,
}

impl EntityCandidate {
    fn width(&self) -> usize {
        self.end - self.start
    }

    fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Job-level acceptance rules for extracted entities.
#[derive(Debug, Clone, Default)]
pub struct EntityFilter {
    /// Minimum confidence kept.
    pub confidence_threshold: f32,
    /// Allowed type tags; empty keeps every type.
    pub entity_types: Vec<String>,
}

impl EntityFilter {
    fn admits(&self, candidate: &EntityCandidate) -> bool {
        candidate.confidence >= self.confidence_threshold
            && (self.entity_types.is_empty()
                || self
                    .entity_types
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(&candidate.entity_type)))
    }
}

/// One way of finding entities in text.
pub trait ExtractionStrategy: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// All candidates found in `text`, possibly overlapping.
    fn extract(&self, text: &str) -> Vec<EntityCandidate>;
}

/// Maps regex byte offsets onto character offsets.
struct CharOffsets(Vec<usize>);

impl CharOffsets {
    fn new(text: &str) -> Self {
        Self(text.char_indices().map(|(offset, _)| offset).collect())
    }

    fn of(&self, byte: usize) -> usize {
        self.0.partition_point(|&boundary| boundary < byte)
    }
}

fn collect_matches(
    text: &str,
    offsets: &CharOffsets,
    regex: &Regex,
    entity_type: &str,
    confidence: f32,
    out: &mut Vec<EntityCandidate>,
) {
    for found in regex.find_iter(text) {
        out.push(EntityCandidate {
            entity_type: entity_type.to_string(),
            text: found.as_str().to_string(),
            start: offsets.of(found.start()),
            end: offsets.of(found.end()),
            confidence,
        });
    }
}

fn compile(pattern: &str) -> Regex {
    Regex::new(pattern).expect("built-in entity pattern must compile")
}

static PATTERNS: LazyLock<Vec<(&'static str, Regex, f32)>> = LazyLock::new(|| {
    vec![
        (
            "EMAIL",
            compile(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b"),
            0.95,
        ),
        ("URL", compile(r#"\bhttps?://[^\s<>"']+[^\s<>"'.,;:!?)]"#), 0.95),
        (
            "DATE",
            compile(
                r"\b(?:\d{4}-\d{2}-\d{2}|\d{1,2}/\d{1,2}/\d{2,4}|(?:Jan|Feb|Mar|Apr|May|Jun|Jul|Aug|Sep|Oct|Nov|Dec)[a-z]*\.? \d{1,2}(?:st|nd|rd|th)?,? \d{4})\b",
            ),
            0.85,
        ),
        (
            "PHONE",
            compile(r"(?:\+\d{1,3}[ .-]?)?\(?\b\d{3}\)?[ .-]\d{3}[ .-]\d{4}\b"),
            0.8,
        ),
        (
            "MONEY",
            compile(r"[$€£]\s?\d{1,3}(?:,\d{3})*(?:\.\d+)?(?:\s?(?:million|billion|[MBK]))?"),
            0.9,
        ),
    ]
});

static PROPER_NOUN: LazyLock<Regex> =
    LazyLock::new(|| compile(r"\b[A-Z][a-z]+(?:\s+(?:of\s+|the\s+)?[A-Z][a-z]+)+\b"));

/// Regex rules for structured values (EMAIL, URL, DATE, PHONE, MONEY).
pub struct PatternStrategy;

impl ExtractionStrategy for PatternStrategy {
    fn name(&self) -> &str {
        "patterns"
    }

    fn extract(&self, text: &str) -> Vec<EntityCandidate> {
        let offsets = CharOffsets::new(text);
        let mut found = Vec::new();
        for (entity_type, regex, confidence) in PATTERNS.iter() {
            collect_matches(text, &offsets, regex, entity_type, *confidence, &mut found);
        }
        found
    }
}

/// Multi-word capitalized phrases tagged `PROPER_NOUN` at low confidence.
pub struct ProperNounStrategy {
    confidence: f32,
}

impl Default for ProperNounStrategy {
    fn default() -> Self {
        Self { confidence: 0.55 }
    }
}

impl ExtractionStrategy for ProperNounStrategy {
    fn name(&self) -> &str {
        "proper-nouns"
    }

    fn extract(&self, text: &str) -> Vec<EntityCandidate> {
        let offsets = CharOffsets::new(text);
        let mut found = Vec::new();
        collect_matches(
            text,
            &offsets,
            &PROPER_NOUN,
            "PROPER_NOUN",
            self.confidence,
            &mut found,
        );
        found
    }
}

/// Case-insensitive whole-word lookup of known terms, at high confidence.
pub struct DictionaryStrategy {
    entries: Vec<(String, Regex)>,
    confidence: f32,
}

impl DictionaryStrategy {
    /// Build from `type -> terms`; empty terms are ignored.
    pub fn new(dictionary: &BTreeMap<String, Vec<String>>) -> Result<Self, regex::Error> {
        let mut entries = Vec::new();
        for (entity_type, terms) in dictionary {
            let alternatives: Vec<String> = terms
                .iter()
                .map(|term| term.trim())
                .filter(|term| !term.is_empty())
                .map(regex::escape)
                .collect();
            if alternatives.is_empty() {
                continue;
            }
            let pattern = format!(r"(?i)\b(?:{})\b", alternatives.join("|"));
            entries.push((entity_type.to_uppercase(), Regex::new(&pattern)?));
        }
        Ok(Self {
            entries,
            confidence: 0.9,
        })
    }
}

impl ExtractionStrategy for DictionaryStrategy {
    fn name(&self) -> &str {
        "dictionary"
    }

    fn extract(&self, text: &str) -> Vec<EntityCandidate> {
        let offsets = CharOffsets::new(text);
        let mut found = Vec::new();
        for (entity_type, regex) in &self.entries {
            collect_matches(text, &offsets, regex, entity_type, self.confidence, &mut found);
        }
        found
    }
}

fn priority(left: &EntityCandidate, right: &EntityCandidate) -> Ordering {
    right
        .confidence
        .total_cmp(&left.confidence)
        .then_with(|| left.width().cmp(&right.width()))
        .then_with(|| left.start.cmp(&right.start))
        .then_with(|| left.entity_type.cmp(&right.entity_type))
}

/// Keep the best candidate of every overlapping group; result ordered by start offset.
pub fn resolve_overlaps(mut candidates: Vec<EntityCandidate>) -> Vec<EntityCandidate> {
    candidates.sort_by(priority);
    let mut accepted: Vec<EntityCandidate> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if accepted.iter().all(|kept| !kept.overlaps(&candidate)) {
            accepted.push(candidate);
        }
    }
    accepted.sort_by(|left, right| {
        left.start
            .cmp(&right.start)
            .then_with(|| left.end.cmp(&right.end))
    });
    accepted
}

/// Runs strategies in order and merges their output.
pub struct EntityExtractor {
    strategies: Vec<Box<dyn ExtractionStrategy>>,
}

impl Default for EntityExtractor {
    fn default() -> Self {
        Self::new()
            .with_strategy(PatternStrategy)
            .with_strategy(ProperNounStrategy::default())
    }
}

impl EntityExtractor {
    /// Extractor with no strategies.
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    /// Append a strategy.
    pub fn with_strategy(mut self, strategy: impl ExtractionStrategy + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    /// Extract, resolve overlaps, then filter.
    ///
    /// Filtering runs after overlap resolution, so a low-confidence span that lost to a
    /// higher-confidence one is never resurrected by a type filter.
    pub fn extract(&self, text: &str, filter: &EntityFilter) -> Vec<EntityCandidate> {
        let candidates: Vec<_> = self
            .strategies
            .iter()
            .flat_map(|strategy| {
                let found = strategy.extract(text);
                tracing::trace!(strategy = strategy.name(), found = found.len(), "Strategy ran");
                found
            })
            .collect();
        resolve_overlaps(candidates)
            .into_iter()
            .filter(|candidate| filter.admits(candidate))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(entity_type: &str, start: usize, end: usize, confidence: f32) -> EntityCandidate {
        EntityCandidate {
            entity_type: entity_type.into(),
            text: String::new(),
            start,
            end,
            confidence,
        }
    }

    fn types(found: &[EntityCandidate]) -> Vec<&str> {
        found.iter().map(|c| c.entity_type.as_str()).collect()
    }

    #[test]
    fn patterns_find_structured_values() {
        let text = "Mail jane@example.com or visit https://example.com/docs. \
                    Due 2024-03-15, costs $1,200.50, call 555-123-4567.";
        let found = EntityExtractor::new()
            .with_strategy(PatternStrategy)
            .extract(text, &EntityFilter::default());
        assert_eq!(types(&found), vec!["EMAIL", "URL", "DATE", "MONEY", "PHONE"]);
        assert_eq!(found[0].text, "jane@example.com");
        assert_eq!(found[1].text, "https://example.com/docs");
    }

    #[test]
    fn higher_confidence_wins_overlap() {
        let resolved = resolve_overlaps(vec![
            candidate("PROPER_NOUN", 0, 10, 0.5),
            candidate("ORG", 2, 8, 0.9),
        ]);
        assert_eq!(types(&resolved), vec!["ORG"]);
    }

    #[test]
    fn narrower_span_wins_confidence_tie() {
        let resolved = resolve_overlaps(vec![
            candidate("WIDE", 0, 10, 0.8),
            candidate("NARROW", 3, 6, 0.8),
            candidate("SEPARATE", 12, 15, 0.1),
        ]);
        assert_eq!(types(&resolved), vec!["NARROW", "SEPARATE"]);
    }

    #[test]
    fn touching_spans_do_not_overlap() {
        let resolved = resolve_overlaps(vec![candidate("A", 0, 5, 0.9), candidate("B", 5, 9, 0.9)]);
        assert_eq!(resolved.len(), 2);
    }

    #[test]
    fn dictionary_beats_proper_noun_heuristic() {
        let dictionary =
            BTreeMap::from([("org".to_string(), vec!["Acme Corp".to_string()])]);
        let extractor = EntityExtractor::default()
            .with_strategy(DictionaryStrategy::new(&dictionary).unwrap());
        let found = extractor.extract("We met Acme Corp yesterday.", &EntityFilter::default());
        assert_eq!(types(&found), vec!["ORG"]);
        assert_eq!(found[0].start, 7);
        assert_eq!(found[0].end, 16);
    }

    #[test]
    fn filter_applies_threshold_and_types() {
        let extractor = EntityExtractor::default();
        let text = "Ada Lovelace wrote to ada@example.org";
        let all = extractor.extract(text, &EntityFilter::default());
        assert_eq!(types(&all), vec!["PROPER_NOUN", "EMAIL"]);

        let confident = extractor.extract(
            text,
            &EntityFilter {
                confidence_threshold: 0.6,
                entity_types: Vec::new(),
            },
        );
        assert_eq!(types(&confident), vec!["EMAIL"]);

        let typed = extractor.extract(
            text,
            &EntityFilter {
                confidence_threshold: 0.0,
                entity_types: vec!["proper_noun".into()],
            },
        );
        assert_eq!(types(&typed), vec!["PROPER_NOUN"]);
    }

    #[test]
    fn offsets_are_in_characters() {
        let found = EntityExtractor::new()
            .with_strategy(PatternStrategy)
            .extract("Café: bob@example.com", &EntityFilter::default());
        assert_eq!(found[0].start, 6);
        assert_eq!(found[0].end, 21);
    }
}
