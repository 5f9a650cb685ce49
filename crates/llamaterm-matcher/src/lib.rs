use llamaterm_core::Labeled;
use regex::Regex;
use std::sync::OnceLock;

pub const STOP_WORDS: [&str; 11] = [
    "no", "yes", "a", "the", "then", "to", "if", "or", "this", "that", "is",
];

pub const TOPIC_MATCH_THRESHOLD: f64 = 0.5;
pub const CATEGORY_MATCH_THRESHOLD: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoredCandidate {
    pub id: i64,
    pub hits: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchScore {
    pub significant_words: usize,
    pub best: Option<ScoredCandidate>,
}

impl MatchScore {
    pub fn ratio(&self) -> f64 {
        match self.best {
            Some(best) if self.significant_words > 0 => {
                best.hits as f64 / self.significant_words as f64
            }
            _ => 0.0,
        }
    }

    pub fn selected(&self, threshold: f64) -> Option<i64> {
        let best = self.best?;
        (self.ratio() > threshold).then_some(best.id)
    }
}

pub fn significant_words(summary: &str) -> Vec<String> {
    summary
        .split_whitespace()
        .map(str::to_lowercase)
        .filter(|word| !STOP_WORDS.contains(&word.as_str()))
        .collect()
}

// Ties on the highest count go to the candidate hit first.
pub fn score_summary<T: Labeled>(summary: &str, candidates: &[T]) -> MatchScore {
    let words = significant_words(summary);
    let lowered = candidates
        .iter()
        .map(|candidate| (candidate.id(), candidate.text().to_lowercase()))
        .collect::<Vec<_>>();

    // (id, hits) in order of first hit.
    let mut counters: Vec<(i64, usize)> = Vec::new();
    for word in &words {
        for (id, text) in &lowered {
            if !text.contains(word.as_str()) {
                continue;
            }
            match counters.iter_mut().find(|(seen, _)| seen == id) {
                Some((_, hits)) => *hits += 1,
                None => counters.push((*id, 1)),
            }
        }
    }

    let mut best: Option<ScoredCandidate> = None;
    for (id, hits) in counters {
        if best.map_or(true, |current| hits > current.hits) {
            best = Some(ScoredCandidate { id, hits });
        }
    }

    MatchScore {
        significant_words: words.len(),
        best,
    }
}

pub fn match_summary<T: Labeled>(summary: &str, candidates: &[T], threshold: f64) -> Option<i64> {
    score_summary(summary, candidates).selected(threshold)
}

fn non_word_chars() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[^A-Za-z0-9\s]").expect("valid regex"))
}

pub fn sanitize_summary(raw: &str) -> String {
    let stripped = non_word_chars().replace_all(raw, "");
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}
