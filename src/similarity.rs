//! Numeric primitives shared by the linker and the cluster engine.

use std::collections::{BTreeSet, HashMap};

/// Cosine similarity in \[-1, 1\]. Returns 0.0 for empty, mismatched or zero
/// vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (x as f64, y as f64);
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

/// Edge weight for an index-reported distance: `1 / (1 + d)`, or 0.0 when
/// the distance is unknown.
pub fn weight_from_distance(d: Option<f64>) -> f64 {
    match d {
        Some(d) => 1.0 / (1.0 + d),
        None => 0.0,
    }
}

/// Split a comma-delimited tag string into a lowercased set.
pub fn parse_tags(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

pub fn tag_overlap(a: &BTreeSet<String>, b: &BTreeSet<String>) -> usize {
    a.intersection(b).count()
}

const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "with", "from", "that", "this", "into", "over", "under", "about", "your",
    "you", "to", "of", "in", "on", "a", "an", "it", "is", "are", "as", "by", "at", "be", "or", "we",
    "our", "how",
];

/// Words of a title: an ASCII letter followed by letters, hyphens or
/// apostrophes, lowercased. Single letters are dropped.
fn title_words(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    let mut words = Vec::new();
    let mut current = String::new();
    for c in lower.chars() {
        let continues = !current.is_empty() && (c == '-' || c == '\'');
        if c.is_ascii_alphabetic() || continues {
            current.push(c);
        } else {
            if current.len() > 1 {
                words.push(std::mem::take(&mut current));
            }
            current.clear();
        }
    }
    if current.len() > 1 {
        words.push(current);
    }
    words
}

/// The `n` most frequent title tokens of length ≥ 3, excluding stop words.
/// Ties keep first-seen order.
pub fn top_tokens<S: AsRef<str>>(texts: &[S], n: usize) -> Vec<String> {
    let mut order: Vec<String> = Vec::new();
    let mut counts: HashMap<String, usize> = HashMap::new();
    for text in texts {
        for w in title_words(text.as_ref()) {
            if w.len() < 3 || STOP_WORDS.contains(&w.as_str()) {
                continue;
            }
            let c = counts.entry(w.clone()).or_insert(0);
            if *c == 0 {
                order.push(w);
            }
            *c += 1;
        }
    }
    // Stable sort keeps first-seen order among equal counts.
    order.sort_by(|a, b| counts[b].cmp(&counts[a]));
    order.truncate(n);
    order
}
