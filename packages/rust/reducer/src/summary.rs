//! Candidate summary phrases and cross-page boilerplate removal.
//!
//! A summary phrase is short text from a heading or a label-like element.
//! Phrases shared by several pages of one site (navigation, footers, cookie
//! banners) say nothing about any single page and are removed once the whole
//! job has been collected.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use scraper::{Html, Selector};
use tracing::debug;

/// Longest phrase (in words) still treated as a label rather than prose.
pub const MAX_PHRASE_WORDS: usize = 10;

static PHRASE_SEL: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(
        "title, h1, h2, h3, h4, h5, h6, p, span, a, li, button, label, strong, td, th, figcaption",
    )
    .expect("valid selector")
});

/// Collect short, distinct text phrases from `content` in document order.
///
/// Accepts either raw markup or the reducer's indented output.
pub fn extract_summary_phrases(content: &str) -> Vec<String> {
    let doc = Html::parse_document(content);
    let mut seen = HashSet::new();
    let mut phrases = Vec::new();

    for el in doc.select(&PHRASE_SEL) {
        let words: Vec<&str> = el.text().flat_map(str::split_whitespace).collect();
        if words.is_empty() || words.len() > MAX_PHRASE_WORDS {
            continue;
        }
        let phrase = words.join(" ");
        if seen.insert(phrase.clone()) {
            phrases.push(phrase);
        }
    }

    phrases
}

/// Remove every phrase that occurs in more than one of `summaries`.
///
/// Returns the number of distinct phrases removed.
pub fn remove_boilerplate<'a, I>(summaries: I) -> usize
where
    I: IntoIterator<Item = &'a mut Vec<String>>,
{
    let mut summaries: Vec<&mut Vec<String>> = summaries.into_iter().collect();

    let mut page_counts: HashMap<String, usize> = HashMap::new();
    for summary in &summaries {
        let distinct: HashSet<&String> = summary.iter().collect();
        for phrase in distinct {
            *page_counts.entry(phrase.clone()).or_default() += 1;
        }
    }

    let boilerplate: HashSet<String> = page_counts
        .into_iter()
        .filter(|(_, pages)| *pages > 1)
        .map(|(phrase, _)| phrase)
        .collect();
    if boilerplate.is_empty() {
        return 0;
    }

    for summary in summaries.iter_mut() {
        summary.retain(|phrase| !boilerplate.contains(phrase));
    }
    debug!(removed = boilerplate.len(), "removed boilerplate phrases");
    boilerplate.len()
}
