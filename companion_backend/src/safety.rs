//! Refusal interception.
//!
//! Provider refusals and disclaimers break character. When a reply contains
//! any configured marker it is discarded and replaced with a random
//! in-character deflection.

use rand::seq::SliceRandom;
use rand::Rng;

use crate::config::SafetyConfig;

const FALLBACK_DEFLECTION: &str = "Uff... chhodo na ye sab, kuch aur baat karo. 🙈";

#[derive(Debug, Clone)]
pub struct SafetyFilter {
    markers: Vec<String>,
    deflections: Vec<String>,
}

impl SafetyFilter {
    pub fn new<I, J>(markers: I, deflections: J) -> Self
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        J: IntoIterator,
        J::Item: AsRef<str>,
    {
        let markers = markers
            .into_iter()
            .map(|m| m.as_ref().trim().to_lowercase())
            .filter(|m| !m.is_empty())
            .collect();
        let mut deflections: Vec<String> = deflections
            .into_iter()
            .map(|d| d.as_ref().trim().to_string())
            .filter(|d| !d.is_empty())
            .collect();
        if deflections.is_empty() {
            deflections.push(FALLBACK_DEFLECTION.to_string());
        }
        Self {
            markers,
            deflections,
        }
    }

    pub fn from_config(config: &SafetyConfig) -> Self {
        Self::new(&config.refusal_markers, &config.deflections)
    }

    pub fn is_refusal(&self, reply: &str) -> bool {
        let lowered = reply.to_lowercase();
        self.markers
            .iter()
            .any(|marker| lowered.contains(marker.as_str()))
    }

    /// Return `raw` unchanged, or a deflection if it reads like a refusal.
    pub fn filter<R: Rng + ?Sized>(&self, raw: &str, rng: &mut R) -> String {
        if !self.is_refusal(raw) {
            return raw.to_string();
        }
        tracing::info!("Intercepted provider refusal, substituting deflection");
        self.deflections
            .choose(rng)
            .cloned()
            .unwrap_or_else(|| FALLBACK_DEFLECTION.to_string())
    }

    pub fn deflections(&self) -> &[String] {
        &self.deflections
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    fn filter() -> SafetyFilter {
        SafetyFilter::from_config(&SafetyConfig::default())
    }

    #[test]
    fn clean_text_passes_unchanged_and_is_idempotent() {
        let filter = filter();
        let mut rng = StdRng::seed_from_u64(1);
        for text in ["hii baby", "kya kar rahe ho? 😘", ""] {
            let once = filter.filter(text, &mut rng);
            assert_eq!(once, text);
            assert_eq!(filter.filter(&once, &mut rng), once);
        }
    }

    #[test]
    fn markers_match_case_insensitively() {
        let filter = filter();
        assert!(filter.is_refusal("i CANNOT continue this conversation"));
        assert!(filter.is_refusal("As an ai Language Model I ..."));
        assert!(!filter.is_refusal("main tumhe miss kar rahi thi"));
    }

    #[test]
    fn refusal_is_replaced_by_a_configured_deflection() {
        let filter = filter();
        let mut rng = StdRng::seed_from_u64(7);
        let out = filter.filter("I cannot generate explicit content.", &mut rng);
        assert!(filter.deflections().contains(&out));
    }

    #[test]
    fn deflection_choice_covers_the_whole_set() {
        let filter = filter();
        let mut rng = StdRng::seed_from_u64(42);
        let seen: HashSet<String> = (0..200)
            .map(|_| filter.filter("safety guidelines prevent me", &mut rng))
            .collect();
        assert_eq!(seen.len(), filter.deflections().len());
    }

    #[test]
    fn same_seed_same_choice() {
        let filter = filter();
        let a = filter.filter("I cannot", &mut StdRng::seed_from_u64(3));
        let b = filter.filter("I cannot", &mut StdRng::seed_from_u64(3));
        assert_eq!(a, b);
    }

    #[test]
    fn empty_deflection_set_uses_fallback() {
        let filter = SafetyFilter::new(["nope"], Vec::<String>::new());
        let out = filter.filter("nope nope", &mut StdRng::seed_from_u64(0));
        assert_eq!(out, FALLBACK_DEFLECTION);
    }
}
