// ============================================
// bootsmith - matcher.rs
// ============================================
// Scores catalog entries against a free-text query like
// "kali for pentesting" or "windows for gaming".
//
// Scoring:
//   +10  entry id or display name appears in the query
//   +5   per keyword that appears in the query
//   +N   per use-case rule whose trigger word appears in the query
//        (rules live in the catalog file, not here)
//
// Only entries that score above zero are returned, best match first.
// The sort is stable, so equal scores keep catalog order.
// ============================================

use crate::catalog::{Catalog, CatalogEntry};

/// Points for a direct id/name match.
const NAME_MATCH_SCORE: i32 = 10;

/// Points per matching keyword.
const KEYWORD_MATCH_SCORE: i32 = 5;

/// One scored catalog entry. Only produced with `score >= 1`.
#[derive(Debug, Clone)]
pub struct MatchResult<'a> {
    pub entry: &'a CatalogEntry,
    pub score: i32,
}

/// Search the catalog with a natural-language query.
///
/// Never fails: an empty or nonsensical query just returns no results.
pub fn search<'a>(catalog: &'a Catalog, query: &str) -> Vec<MatchResult<'a>> {
    let query = query.to_lowercase();
    if query.trim().is_empty() {
        return Vec::new();
    }

    let mut results: Vec<MatchResult<'a>> = Vec::new();

    for entry in &catalog.entries {
        let mut score = 0;

        // Direct name match
        if query.contains(&entry.id) || query.contains(&entry.name.to_lowercase()) {
            score += NAME_MATCH_SCORE;
        }

        // Keyword matches
        for keyword in &entry.keywords {
            if query.contains(&keyword.to_lowercase()) {
                score += KEYWORD_MATCH_SCORE;
            }
        }

        // Use-case rules - each rule fires at most once per query
        for rule in &catalog.rules {
            if rule.target == entry.id
                && rule.triggers.iter().any(|t| query.contains(t.as_str()))
            {
                score += rule.bonus;
            }
        }

        if score > 0 {
            results.push(MatchResult { entry, score });
        }
    }

    // Stable sort: ties keep catalog order
    results.sort_by(|a, b| b.score.cmp(&a.score));

    log::debug!("query '{}' matched {} entries", query, results.len());
    results
}

// ============================================
// TESTS
// ============================================
