use lazy_static::lazy_static;
use log::warn;
use regex::Regex;

use crate::config::SlotMatchPolicy;
use crate::schema::UiElement;
use crate::snapshot::{self, contains_ignore_case};

lazy_static! {
    /// Day number, month name, abbreviated weekday: "7 февраля, Сб".
    static ref DATE_LABEL: Regex = Regex::new(r"\d+\s+[а-яА-Я]+,\s+[а-яА-Я]{2}").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotVerdict {
    pub found: bool,
    pub labels: Vec<String>,
    pub marker_present: bool,
}

pub struct SlotExtractor {
    policy: SlotMatchPolicy,
    no_slots_marker: String,
}

impl SlotExtractor {
    pub fn new(policy: SlotMatchPolicy, no_slots_marker: impl Into<String>) -> Self {
        Self { policy, no_slots_marker: no_slots_marker.into() }
    }

    pub fn evaluate(&self, root: &UiElement) -> SlotVerdict {
        self.evaluate_texts(&snapshot::collect_texts(root))
    }

    pub fn evaluate_texts(&self, texts: &[String]) -> SlotVerdict {
        let labels = date_labels(texts);
        let marker_present = texts.iter().any(|t| contains_ignore_case(t, &self.no_slots_marker));

        let found = match self.policy {
            SlotMatchPolicy::Strict => !marker_present && !labels.is_empty(),
            SlotMatchPolicy::Lenient => {
                if marker_present && !labels.is_empty() {
                    warn!(
                        "[Slots] '{}' is on screen next to {} date(s); accepting them, result may be a false positive",
                        self.no_slots_marker,
                        labels.len()
                    );
                }
                !labels.is_empty()
            }
        };

        SlotVerdict { found, labels: if found { labels } else { Vec::new() }, marker_present }
    }
}

/// Every date label in `texts`, first occurrence order, without repeats.
pub fn date_labels(texts: &[String]) -> Vec<String> {
    let mut labels: Vec<String> = Vec::new();
    for text in texts {
        for m in DATE_LABEL.find_iter(text) {
            let label = m.as_str().to_string();
            if !labels.contains(&label) {
                labels.push(label);
            }
        }
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::task_list;

    #[test]
    fn test_scenario_a_dates_found() {
        let extractor = SlotExtractor::new(SlotMatchPolicy::Strict, "НЕТ МЕСТ");
        let verdict = extractor.evaluate(&task_list(&["7 февраля, Сб", "8 февраля, Вс"]));
        assert!(verdict.found);
        assert_eq!(verdict.labels, vec!["7 февраля, Сб".to_string(), "8 февраля, Вс".to_string()]);
    }

    #[test]
    fn test_scenario_b_marker_blocks() {
        let extractor = SlotExtractor::new(SlotMatchPolicy::Strict, "НЕТ МЕСТ");
        let verdict = extractor.evaluate(&task_list(&["7 февраля, Сб", "8 февраля, Вс", "НЕТ МЕСТ"]));
        assert!(!verdict.found);
        assert!(verdict.marker_present);
        assert!(verdict.labels.is_empty());
    }

    #[test]
    fn test_lenient_accepts_dates_next_to_marker() {
        let extractor = SlotExtractor::new(SlotMatchPolicy::Lenient, "НЕТ МЕСТ");
        let verdict = extractor.evaluate(&task_list(&["7 февраля, Сб", "нет мест"]));
        assert!(verdict.found);
        assert_eq!(verdict.labels, vec!["7 февраля, Сб".to_string()]);
    }

    #[test]
    fn test_no_dates_is_not_found() {
        let extractor = SlotExtractor::new(SlotMatchPolicy::Lenient, "НЕТ МЕСТ");
        assert!(!extractor.evaluate(&task_list(&[])).found);
    }

    #[test]
    fn test_labels_dedup_in_order() {
        let texts: Vec<String> = ["Смены: 8 февраля, Вс и 7 февраля, Сб", "7 февраля, Сб", "12 марта"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(date_labels(&texts), vec!["8 февраля, Вс".to_string(), "7 февраля, Сб".to_string()]);
    }
}
