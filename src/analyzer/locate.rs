//! Maps a reported code snippet back to file line numbers.
use strsim::normalized_levenshtein;

/// Minimum mean per-line similarity for a fuzzy window match.
pub const FUZZY_THRESHOLD: f64 = 0.6;

/// Lines of `code` covered by `snippet`, numbered from `first_line`.
///
/// An exact substring match wins. Otherwise every window of code lines the
/// size of the snippet is scored by mean per-line similarity (ignoring
/// indentation) and the best window at or above [`FUZZY_THRESHOLD`] is used.
pub fn locate(snippet: &str, code: &str, first_line: usize) -> Option<(usize, usize)> {
    let needle = snippet.trim();
    if needle.is_empty() {
        return None;
    }

    if let Some(offset) = code.find(needle) {
        let start = first_line + code[..offset].matches('\n').count();
        let end = start + needle.lines().count().saturating_sub(1);
        return Some((start, end));
    }

    let wanted: Vec<&str> = needle
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let lines: Vec<&str> = code.lines().collect();
    if wanted.is_empty() || lines.len() < wanted.len() {
        return None;
    }

    let mut best: Option<(usize, f64)> = None;
    for start in 0..=lines.len() - wanted.len() {
        let total: f64 = wanted
            .iter()
            .zip(&lines[start..])
            .map(|(w, l)| normalized_levenshtein(w, l.trim()))
            .sum();
        let score = total / wanted.len() as f64;
        if best.is_none_or(|(_, s)| score > s) {
            best = Some((start, score));
        }
    }

    best.filter(|(_, score)| *score >= FUZZY_THRESHOLD)
        .map(|(start, _)| {
            (
                first_line + start,
                first_line + start + wanted.len() - 1,
            )
        })
}
