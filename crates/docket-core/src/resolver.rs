//! Entity resolution: collapse the mentions of one document into canonical
//! entities.
//!
//! Mentions are grouped by type, normalized, compared pairwise with a small
//! rule set and unioned into connected components. Each component becomes one
//! [`CanonicalEntity`]. The result depends only on the input order of the
//! mentions, so re-running resolution over the same mentions yields the same
//! entities with the same ids.

use std::collections::HashSet;

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::defaults;
use crate::models::{CanonicalEntity, EntityMention, EntityType, MentionAssignment};
use crate::uuid_utils::canonical_entity_id;

static DROPPED_PUNCT: Lazy<Regex> = Lazy::new(|| Regex::new(r"['’.]").expect("valid regex"));
static SPLIT_PUNCT: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\p{L}\p{N}\s]").expect("valid regex"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid regex"));
static ORDINAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d)(st|nd|rd|th)\b").expect("valid regex"));

const HONORIFICS: &[&str] = &["mr", "mrs", "ms", "dr", "hon", "judge", "justice"];
const PERSON_SUFFIXES: &[&str] = &["jr", "sr", "esq", "ii", "iii"];
const ORG_SUFFIXES: &[&str] = &[
    "llc",
    "inc",
    "incorporated",
    "corp",
    "corporation",
    "co",
    "company",
    "ltd",
    "limited",
    "lp",
    "llp",
    "plc",
    "na",
];

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%m/%d/%Y",
    "%m-%d-%Y",
    "%B %d, %Y",
    "%B %d %Y",
    "%b %d, %Y",
    "%b %d %Y",
    "%d %B %Y",
    "%d %b %Y",
    "%Y/%m/%d",
];

/// Tunable thresholds for the matching rules.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Minimum shared/larger token ratio for two multi-word names.
    pub token_overlap: f64,
    /// Minimum tokens the shorter name needs before containment applies.
    pub min_containment_tokens: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            token_overlap: defaults::RESOLVER_TOKEN_OVERLAP,
            min_containment_tokens: defaults::RESOLVER_MIN_CONTAINMENT_TOKENS,
        }
    }
}

impl ResolverConfig {
    pub fn with_token_overlap(mut self, ratio: f64) -> Self {
        self.token_overlap = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn with_min_containment_tokens(mut self, tokens: usize) -> Self {
        self.min_containment_tokens = tokens.max(1);
        self
    }
}

/// Output of one resolution pass.
#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Canonical entities ordered by their earliest member mention.
    pub entities: Vec<CanonicalEntity>,
    /// One assignment per resolved mention, in mention order.
    pub assignments: Vec<MentionAssignment>,
    /// Mentions excluded because their text was empty.
    pub malformed: Vec<Uuid>,
}

impl Resolution {
    /// Mentions that took part in resolution.
    pub fn mention_count(&self) -> usize {
        self.assignments.len()
    }

    /// Mentions in per canonical entity out. 1.0 when nothing was resolved.
    pub fn dedup_ratio(&self) -> f64 {
        if self.entities.is_empty() {
            return 1.0;
        }
        self.assignments.len() as f64 / self.entities.len() as f64
    }
}

/// Deterministic mention canonicalizer.
#[derive(Debug, Clone, Default)]
pub struct EntityResolver {
    config: ResolverConfig,
}

/// A mention's text after normalization.
#[derive(Debug, Clone)]
struct NormalizedName {
    text: String,
    tokens: Vec<String>,
    date: Option<NaiveDate>,
}

impl EntityResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Resolve every mention of one document.
    pub fn resolve(&self, document_id: Uuid, mentions: &[EntityMention]) -> Resolution {
        let mut resolution = Resolution::default();

        // (entity_type, [(mention index, normalized)]) in order of first appearance
        let mut groups: Vec<(EntityType, Vec<(usize, NormalizedName)>)> = Vec::new();
        for (idx, mention) in mentions.iter().enumerate() {
            let Some(name) = normalize(&mention.text, mention.entity_type) else {
                warn!(
                    subsystem = "jobs",
                    component = "resolver",
                    document_id = %document_id,
                    mention_id = %mention.id,
                    entity_type = %mention.entity_type,
                    "Skipping malformed mention with empty text"
                );
                resolution.malformed.push(mention.id);
                continue;
            };
            match groups.iter_mut().find(|(t, _)| *t == mention.entity_type) {
                Some((_, members)) => members.push((idx, name)),
                None => groups.push((mention.entity_type, vec![(idx, name)])),
            }
        }

        // (first mention index, entity, member mention indices)
        let mut components: Vec<(usize, CanonicalEntity, Vec<usize>)> = Vec::new();
        for (entity_type, members) in &groups {
            let mut sets = DisjointSet::new(members.len());
            for i in 0..members.len() {
                for j in (i + 1)..members.len() {
                    if self.matches(*entity_type, &members[i].1, &members[j].1) {
                        sets.union(i, j);
                    }
                }
            }

            for component in sets.components() {
                let indices: Vec<usize> = component.iter().map(|&p| members[p].0).collect();
                let anchor = &mentions[indices[0]];
                let name = canonical_name(mentions, &indices);
                let entity = CanonicalEntity {
                    id: canonical_entity_id(document_id, entity_type.as_str(), anchor.id),
                    document_id,
                    name,
                    entity_type: *entity_type,
                    member_count: indices.len(),
                };
                components.push((indices[0], entity, indices));
            }
        }
        components.sort_by_key(|(first, _, _)| *first);

        let mut canonical_of: Vec<Option<Uuid>> = vec![None; mentions.len()];
        for (_, entity, indices) in &components {
            for &idx in indices {
                canonical_of[idx] = Some(entity.id);
            }
        }
        resolution.assignments = mentions
            .iter()
            .zip(canonical_of)
            .filter_map(|(m, c)| {
                c.map(|canonical_id| MentionAssignment {
                    mention_id: m.id,
                    canonical_id,
                })
            })
            .collect();
        resolution.entities = components.into_iter().map(|(_, e, _)| e).collect();

        debug!(
            subsystem = "jobs",
            component = "resolver",
            document_id = %document_id,
            mention_count = resolution.mention_count(),
            entity_count = resolution.entities.len(),
            malformed = resolution.malformed.len(),
            dedup_ratio = resolution.dedup_ratio(),
            "Resolved entity mentions"
        );
        resolution
    }

    fn matches(&self, entity_type: EntityType, a: &NormalizedName, b: &NormalizedName) -> bool {
        if entity_type == EntityType::Date {
            return match (a.date, b.date) {
                (Some(x), Some(y)) => x == y,
                _ => a.text == b.text,
            };
        }
        if a.text == b.text {
            return true;
        }
        self.contains(entity_type, a, b) || self.overlaps(a, b)
    }

    /// One name's tokens appear, in order, inside the other's.
    fn contains(&self, entity_type: EntityType, a: &NormalizedName, b: &NormalizedName) -> bool {
        let (short, long) = if a.tokens.len() <= b.tokens.len() {
            (&a.tokens, &b.tokens)
        } else {
            (&b.tokens, &a.tokens)
        };
        if short.len() < self.config.min_containment_tokens {
            return false;
        }
        let person = entity_type == EntityType::Person;
        if person && short.last() != long.last() {
            return false;
        }

        let mut remaining = long.iter();
        short.iter().all(|s| {
            remaining
                .by_ref()
                .any(|l| s == l || (person && initial_of(s, l)))
        })
    }

    /// Shared tokens over the larger token set.
    fn overlaps(&self, a: &NormalizedName, b: &NormalizedName) -> bool {
        if a.tokens.len() < 2 || b.tokens.len() < 2 {
            return false;
        }
        let left: HashSet<&str> = a.tokens.iter().map(String::as_str).collect();
        let right: HashSet<&str> = b.tokens.iter().map(String::as_str).collect();
        let shared = left.intersection(&right).count();
        let larger = left.len().max(right.len());
        shared as f64 / larger as f64 >= self.config.token_overlap
    }
}

/// `j` is the initial of `javier`, in either direction.
fn initial_of(a: &str, b: &str) -> bool {
    let (initial, full) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    initial.chars().count() == 1 && full.starts_with(initial)
}

/// Most complete member text: most tokens, then longest, then earliest.
fn canonical_name(mentions: &[EntityMention], indices: &[usize]) -> String {
    let mut best = indices[0];
    let mut best_key = (0usize, 0usize);
    for &idx in indices {
        let text = mentions[idx].text.trim();
        let key = (text.split_whitespace().count(), text.chars().count());
        if key > best_key {
            best = idx;
            best_key = key;
        }
    }
    WHITESPACE
        .replace_all(mentions[best].text.trim(), " ")
        .into_owned()
}

/// Normalize a mention's text. `None` when nothing meaningful remains.
fn normalize(raw: &str, entity_type: EntityType) -> Option<NormalizedName> {
    let lowered = raw.trim().to_lowercase();
    if lowered.is_empty() {
        return None;
    }
    let dropped = DROPPED_PUNCT.replace_all(&lowered, "");
    let spaced = SPLIT_PUNCT.replace_all(&dropped, " ");
    let mut tokens: Vec<String> = spaced.split_whitespace().map(str::to_string).collect();

    match entity_type {
        EntityType::Person => {
            while tokens.len() > 1 && HONORIFICS.contains(&tokens[0].as_str()) {
                tokens.remove(0);
            }
            strip_trailing(&mut tokens, PERSON_SUFFIXES);
        }
        EntityType::Date => {}
        _ => strip_trailing(&mut tokens, ORG_SUFFIXES),
    }
    if tokens.is_empty() {
        return None;
    }

    let date = if entity_type == EntityType::Date {
        parse_date(raw)
    } else {
        None
    };
    Some(NormalizedName {
        text: tokens.join(" "),
        tokens,
        date,
    })
}

fn strip_trailing(tokens: &mut Vec<String>, suffixes: &[&str]) {
    while tokens.len() > 1 && tokens.last().is_some_and(|t| suffixes.contains(&t.as_str())) {
        tokens.pop();
    }
}

/// Canonicalize a date mention to a calendar day, if it parses.
fn parse_date(raw: &str) -> Option<NaiveDate> {
    let cleaned = ORDINAL.replace_all(raw.trim(), "$1");
    let cleaned = WHITESPACE.replace_all(&cleaned, " ");
    let cleaned = cleaned.replace(". ", " ");
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(&cleaned, fmt).ok())
}

/// Union-find over positions `0..n` with path compression and union by rank.
struct DisjointSet {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut node = x;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    fn union(&mut self, x: usize, y: usize) {
        let root_x = self.find(x);
        let root_y = self.find(y);
        if root_x == root_y {
            return;
        }
        match self.rank[root_x].cmp(&self.rank[root_y]) {
            std::cmp::Ordering::Less => self.parent[root_x] = root_y,
            std::cmp::Ordering::Greater => self.parent[root_y] = root_x,
            std::cmp::Ordering::Equal => {
                self.parent[root_y] = root_x;
                self.rank[root_x] += 1;
            }
        }
    }

    /// Components as ascending position lists, ordered by smallest member.
    fn components(&mut self) -> Vec<Vec<usize>> {
        let n = self.parent.len();
        let mut slot_of_root: Vec<Option<usize>> = vec![None; n];
        let mut out: Vec<Vec<usize>> = Vec::new();
        for i in 0..n {
            let root = self.find(i);
            match slot_of_root[root] {
                Some(slot) => out[slot].push(i),
                None => {
                    slot_of_root[root] = Some(out.len());
                    out.push(vec![i]);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uuid_utils::{chunk_id, mention_id};

    fn mentions(document_id: Uuid, items: &[(&str, EntityType)]) -> Vec<EntityMention> {
        let chunk = chunk_id(document_id, 0);
        items
            .iter()
            .enumerate()
            .map(|(i, (text, entity_type))| EntityMention {
                id: mention_id(chunk, i),
                document_id,
                chunk_id: chunk,
                text: text.to_string(),
                entity_type: *entity_type,
                start_offset: i * 20,
                end_offset: i * 20 + text.len(),
                confidence: 0.9,
                canonical_id: None,
            })
            .collect()
    }

    fn resolve(items: &[(&str, EntityType)]) -> Resolution {
        let doc = Uuid::new_v4();
        EntityResolver::default().resolve(doc, &mentions(doc, items))
    }

    #[test]
    fn test_person_variants_collapse() {
        let r = resolve(&[
            ("Javier Hinojo", EntityType::Person),
            ("Javier Hinojo", EntityType::Person),
            ("J. Hinojo", EntityType::Person),
        ]);
        assert_eq!(r.entities.len(), 1);
        assert_eq!(r.entities[0].member_count, 3);
        assert_eq!(r.entities[0].name, "Javier Hinojo");
        assert!((r.dedup_ratio() - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_org_suffix_is_ignored() {
        let r = resolve(&[
            ("Wombat Acquisitions", EntityType::Organization),
            ("Wombat Acquisitions, LLC", EntityType::Organization),
        ]);
        assert_eq!(r.entities.len(), 1);
        assert_eq!(r.entities[0].member_count, 2);
        assert_eq!(r.entities[0].name, "Wombat Acquisitions, LLC");
    }

    #[test]
    fn test_types_never_merge() {
        let r = resolve(&[
            ("Jordan", EntityType::Person),
            ("Jordan", EntityType::Location),
        ]);
        assert_eq!(r.entities.len(), 2);
        assert_ne!(r.entities[0].entity_type, r.entities[1].entity_type);
        assert!(r.entities.iter().all(|e| e.member_count == 1));
    }

    #[test]
    fn test_middle_initial_containment() {
        let r = resolve(&[
            ("Joseph Ott", EntityType::Person),
            ("Joseph A. Ott", EntityType::Person),
        ]);
        assert_eq!(r.entities.len(), 1);
        assert_eq!(r.entities[0].name, "Joseph A. Ott");
    }

    #[test]
    fn test_different_surnames_stay_apart() {
        let r = resolve(&[
            ("J. Hinojo", EntityType::Person),
            ("J. Smith", EntityType::Person),
            ("Hinojo", EntityType::Person),
        ]);
        assert_eq!(r.entities.len(), 3);
    }

    #[test]
    fn test_honorific_stripped() {
        let r = resolve(&[
            ("Dr. Maria Alvarez", EntityType::Person),
            ("Maria Alvarez", EntityType::Person),
        ]);
        assert_eq!(r.entities.len(), 1);
    }

    #[test]
    fn test_dates_match_after_canonicalization() {
        let r = resolve(&[
            ("March 3, 2021", EntityType::Date),
            ("2021-03-03", EntityType::Date),
            ("03/03/2021", EntityType::Date),
            ("March 3rd, 2021", EntityType::Date),
            ("March 4, 2021", EntityType::Date),
        ]);
        assert_eq!(r.entities.len(), 2);
        assert_eq!(r.entities[0].member_count, 4);
        assert_eq!(r.entities[1].member_count, 1);
    }

    #[test]
    fn test_token_overlap_for_multi_word_names() {
        let r = resolve(&[
            ("First National Bank of Ohio", EntityType::Organization),
            ("National Bank of Ohio First", EntityType::Organization),
            ("Bank of America", EntityType::Organization),
        ]);
        assert_eq!(r.entities.len(), 2);
    }

    #[test]
    fn test_empty_text_is_malformed() {
        let r = resolve(&[
            ("", EntityType::Person),
            ("   ", EntityType::Person),
            ("Javier Hinojo", EntityType::Person),
            ("...", EntityType::Organization),
        ]);
        assert_eq!(r.malformed.len(), 3);
        assert_eq!(r.entities.len(), 1);
        assert_eq!(r.mention_count(), 1);
    }

    #[test]
    fn test_assignments_cover_every_valid_mention() {
        let doc = Uuid::new_v4();
        let ms = mentions(
            doc,
            &[
                ("Acme Corp", EntityType::Organization),
                ("Acme Corporation", EntityType::Organization),
                ("Paula Reyes", EntityType::Person),
            ],
        );
        let r = EntityResolver::default().resolve(doc, &ms);
        assert_eq!(r.assignments.len(), 3);
        assert_eq!(r.assignments[0].canonical_id, r.assignments[1].canonical_id);
        assert_ne!(r.assignments[0].canonical_id, r.assignments[2].canonical_id);
        for (m, a) in ms.iter().zip(&r.assignments) {
            assert_eq!(m.id, a.mention_id);
        }
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let doc = Uuid::new_v4();
        let ms = mentions(
            doc,
            &[
                ("Wombat Acquisitions", EntityType::Organization),
                ("Javier Hinojo", EntityType::Person),
                ("Wombat Acquisitions LLC", EntityType::Organization),
                ("J. Hinojo", EntityType::Person),
            ],
        );
        let resolver = EntityResolver::default();
        let first = resolver.resolve(doc, &ms);
        let second = resolver.resolve(doc, &ms);
        assert_eq!(first.entities, second.entities);
        assert_eq!(first.assignments, second.assignments);
        // Ordered by earliest member
        assert_eq!(first.entities[0].entity_type, EntityType::Organization);
        assert_eq!(first.entities[1].entity_type, EntityType::Person);
    }

    #[test]
    fn test_stricter_overlap_threshold() {
        let doc = Uuid::new_v4();
        let ms = mentions(
            doc,
            &[
                ("Smith Jones Partners", EntityType::Organization),
                ("Smith Jones Advisors", EntityType::Organization),
            ],
        );
        let loose = EntityResolver::new(ResolverConfig::default().with_token_overlap(0.5));
        assert_eq!(loose.resolve(doc, &ms).entities.len(), 1);
        let strict = EntityResolver::default();
        assert_eq!(strict.resolve(doc, &ms).entities.len(), 2);
    }

    #[test]
    fn test_disjoint_set_components() {
        let mut sets = DisjointSet::new(5);
        sets.union(0, 3);
        sets.union(3, 4);
        assert_eq!(sets.components(), vec![vec![0, 3, 4], vec![1], vec![2]]);
    }
}
