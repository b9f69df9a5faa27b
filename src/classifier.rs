//! Screen classification by weighted anchor matching.
//!
//! Each known screen kind carries a list of anchors. Positive weights are
//! evidence for the kind, negative weights are evidence that the screen is a
//! different kind. Scores are clamped to `[0, 1]`; the best kind wins unless
//! its score is under [`MIN_CONFIDENCE`].

use std::collections::BTreeSet;
use std::fmt;

use log::{debug, warn};

use crate::config::{MonitorConfig, UiVocabulary};
use crate::schema::UiElement;
use crate::snapshot::{contains_ignore_case, equals_ignore_case};

pub const MIN_CONFIDENCE: f32 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScreenKind {
    MainHub,
    ResourceSelectionList,
    ResourceCard,
    TaskList,
    Unknown,
}

impl fmt::Display for ScreenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScreenKind::MainHub => "main hub",
            ScreenKind::ResourceSelectionList => "resource list",
            ScreenKind::ResourceCard => "resource card",
            ScreenKind::TaskList => "task list",
            ScreenKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScreenResult {
    pub kind: ScreenKind,
    pub confidence: f32,
    pub matched_anchors: BTreeSet<String>,
}

impl ScreenResult {
    pub fn unknown() -> Self {
        Self { kind: ScreenKind::Unknown, confidence: 0.0, matched_anchors: BTreeSet::new() }
    }

    pub fn is_confident(&self) -> bool {
        self.kind != ScreenKind::Unknown && self.confidence >= MIN_CONFIDENCE
    }
}

/// What an anchor looks for.
#[derive(Debug, Clone)]
enum Rule {
    /// Some text or description contains the needle.
    TextContains(String),
    /// Some text or description equals the needle.
    TextEquals(String),
    /// Some text or description equals any of the needles.
    TextEqualsAny(Vec<String>),
    /// Some element id contains any of the fragments.
    IdContainsAny(Vec<String>),
    /// A search-capable element: id contains the fragment or description
    /// contains the word.
    SearchField { id_fragment: String, description: String },
}

#[derive(Debug, Clone)]
struct Anchor {
    name: String,
    rule: Rule,
    weight: f32,
}

impl Anchor {
    fn new(name: impl Into<String>, rule: Rule, weight: f32) -> Self {
        Self { name: name.into(), rule, weight }
    }

    fn contains(needle: &str, weight: f32) -> Self {
        Self::new(needle, Rule::TextContains(needle.to_string()), weight)
    }

    fn equals(needle: &str, weight: f32) -> Self {
        Self::new(needle, Rule::TextEquals(needle.to_string()), weight)
    }

    /// Name of the matched evidence, `None` when the anchor is absent.
    fn probe(&self, features: &Features) -> Option<String> {
        match &self.rule {
            Rule::TextContains(needle) => features
                .texts
                .iter()
                .any(|t| contains_ignore_case(t, needle))
                .then(|| self.name.clone()),
            Rule::TextEquals(needle) => features
                .texts
                .iter()
                .any(|t| equals_ignore_case(t.trim(), needle))
                .then(|| self.name.clone()),
            Rule::TextEqualsAny(needles) => needles
                .iter()
                .find(|n| features.texts.iter().any(|t| equals_ignore_case(t.trim(), n)))
                .cloned(),
            Rule::IdContainsAny(fragments) => features
                .ids
                .iter()
                .any(|id| fragments.iter().any(|f| id.contains(f.as_str())))
                .then(|| self.name.clone()),
            Rule::SearchField { id_fragment, description } => {
                let by_id = features.ids.iter().any(|id| contains_ignore_case(id, id_fragment));
                let by_desc = features.descriptions.iter().any(|d| contains_ignore_case(d, description));
                (by_id || by_desc).then(|| self.name.clone())
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Profile {
    kind: ScreenKind,
    anchors: Vec<Anchor>,
}

/// Flattened view of a snapshot, computed once per classification.
#[derive(Default)]
struct Features {
    texts: Vec<String>,
    descriptions: Vec<String>,
    ids: Vec<String>,
}

impl Features {
    fn extract(root: &UiElement) -> Self {
        let mut features = Features::default();
        features.visit(root);
        features
    }

    fn visit(&mut self, node: &UiElement) {
        if let Some(t) = node.text.as_deref().filter(|t| !t.trim().is_empty()) {
            self.texts.push(t.to_string());
        }
        if let Some(d) = node.description.as_deref().filter(|d| !d.trim().is_empty()) {
            self.texts.push(d.to_string());
            self.descriptions.push(d.to_string());
        }
        if let Some(id) = node.id.as_deref().filter(|id| !id.is_empty()) {
            self.ids.push(id.to_string());
        }
        for child in &node.children {
            self.visit(child);
        }
    }
}

pub struct Classifier {
    profiles: Vec<Profile>,
}

impl Classifier {
    pub fn new(config: &MonitorConfig) -> Self {
        Self { profiles: catalogue(&config.vocabulary, &config.target_location, &config.target_task) }
    }

    /// Pure and total: the same snapshot always yields the same result.
    pub fn classify(&self, snapshot: Option<&UiElement>) -> ScreenResult {
        let Some(root) = snapshot else {
            return ScreenResult::unknown();
        };
        let features = Features::extract(root);

        let mut best: Option<(ScreenKind, f32, BTreeSet<String>)> = None;
        for profile in &self.profiles {
            let (score, anchors) = score_profile(profile, &features);
            let better = match &best {
                Some((_, best_score, _)) => score > *best_score,
                None => true,
            };
            if better {
                best = Some((profile.kind, score, anchors));
            }
        }

        let Some((kind, confidence, matched_anchors)) = best else {
            return ScreenResult::unknown();
        };

        if confidence < MIN_CONFIDENCE {
            if confidence > 0.0 {
                warn!(
                    "[Classifier] Low confidence {:.2} for {} (anchors: {:?}), treating as unknown",
                    confidence, kind, matched_anchors
                );
            }
            return ScreenResult { kind: ScreenKind::Unknown, confidence, matched_anchors };
        }

        debug!("[Classifier] {} ({:.2}) anchors={:?}", kind, confidence, matched_anchors);
        ScreenResult { kind, confidence, matched_anchors }
    }
}

fn score_profile(profile: &Profile, features: &Features) -> (f32, BTreeSet<String>) {
    let mut score = 0.0f32;
    let mut matched = BTreeSet::new();
    for anchor in &profile.anchors {
        if let Some(name) = anchor.probe(features) {
            score += anchor.weight;
            if anchor.weight < 0.0 {
                matched.insert(format!("!{}", name));
            } else {
                matched.insert(name);
            }
        }
    }
    (score.clamp(0.0, 1.0), matched)
}

fn catalogue(vocab: &UiVocabulary, location: &str, task: &str) -> Vec<Profile> {
    vec![
        Profile {
            kind: ScreenKind::TaskList,
            anchors: vec![
                Anchor::contains(task, 0.5),
                Anchor::contains(&vocab.back_to_tasks_label, 0.25),
                Anchor::contains(&vocab.choose_time_label, 0.25),
                Anchor::contains(&vocab.registration_marker, 0.15),
            ],
        },
        Profile {
            kind: ScreenKind::ResourceCard,
            anchors: vec![
                Anchor::equals(location, 0.25),
                Anchor::new(
                    vocab.enroll_label.clone(),
                    Rule::TextEqualsAny(vec![vocab.enroll_label.clone(), vocab.schedule_label.clone()]),
                    0.4,
                ),
                Anchor::contains(&vocab.region_marker, 0.15),
                Anchor::contains(&vocab.list_header, -0.3),
            ],
        },
        Profile {
            kind: ScreenKind::ResourceSelectionList,
            anchors: vec![
                Anchor::contains(&vocab.list_header, 0.5),
                Anchor::equals(&vocab.map_label, 0.2),
                Anchor::new(
                    "search-field",
                    Rule::SearchField {
                        id_fragment: vocab.search_id_fragment.clone(),
                        description: vocab.search_description.clone(),
                    },
                    0.2,
                ),
                Anchor::equals(&vocab.enroll_label, -0.4),
            ],
        },
        Profile {
            kind: ScreenKind::MainHub,
            anchors: vec![
                Anchor::new("bottom-nav", Rule::IdContainsAny(vocab.hub_tab_ids.clone()), 0.3),
                Anchor::contains(&vocab.category_tab_label, 0.2),
                Anchor::contains(&vocab.hub_payments_label, 0.15),
                Anchor::contains(&vocab.hub_records_label, 0.2),
                Anchor::contains(&vocab.list_header, -0.4),
                Anchor::equals(&vocab.enroll_label, -0.3),
            ],
        },
    ]
}
