use std::collections::HashSet;
use std::ops::Range;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::archive::checksum_from_file_name;
use crate::indexer::{IndexTable, SearchIndex};

/// Characters of context kept on each side of a match.
pub const SNIPPET_CONTEXT: usize = 80;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SearchHit {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    pub path: String,
    pub subject: String,
    pub from: String,
    pub to: String,
    pub date: Option<DateTime<Utc>>,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SearchResults {
    pub query: String,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
    pub hits: Vec<SearchHit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indexed_at: Option<DateTime<Utc>>,
}

/// Lower-cases one char at a time so the folded text has exactly as many
/// chars as the original. Match positions carry over between the two.
pub fn fold_case(value: &str) -> String {
    value
        .chars()
        .map(|c| c.to_lowercase().next().unwrap_or(c))
        .collect()
}

pub fn normalize_query(query: &str) -> String {
    fold_case(query.trim())
}

/// The slice of an already date-ordered result list one page covers.
/// `limit == 0` means everything after `offset`.
pub fn page_range(total: usize, offset: usize, limit: usize) -> Range<usize> {
    let start = offset.min(total);
    let end = if limit == 0 {
        total
    } else {
        start.saturating_add(limit).min(total)
    };
    start..end
}

/// Context around the first match, preferring the subject over the body.
/// Inputs come in pairs of original and [`fold_case`]d text.
pub fn snippet(
    subject: (&str, &str),
    body: (&str, &str),
    folded_query: &str,
) -> Option<String> {
    if folded_query.is_empty() {
        return None;
    }
    [subject, body]
        .into_iter()
        .find_map(|(original, folded)| window(original, folded, folded_query))
}

fn window(original: &str, folded: &str, folded_query: &str) -> Option<String> {
    let byte_pos = folded.find(folded_query)?;
    let start = folded[..byte_pos].chars().count();
    let end = start + folded_query.chars().count();
    let len = original.chars().count();

    let from = start.saturating_sub(SNIPPET_CONTEXT);
    let to = (end + SNIPPET_CONTEXT).min(len);
    let excerpt: String = original.chars().skip(from).take(to - from).collect();
    let excerpt = excerpt.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut out = String::with_capacity(excerpt.len() + 6);
    if from > 0 {
        out.push_str("...");
    }
    out.push_str(&excerpt);
    if to < len {
        out.push_str("...");
    }
    Some(out)
}

/// Runs `query` over several accounts' indexes as one result set. Messages
/// present in more than one account count once; the first account listed
/// wins.
pub fn search_multi(
    indexes: &[(String, Arc<SearchIndex>)],
    query: &str,
    offset: usize,
    limit: usize,
) -> SearchResults {
    let folded_query = normalize_query(query);

    let mut candidates: Vec<(&str, Arc<IndexTable>, usize)> = Vec::new();
    let mut indexed_at: Option<DateTime<Utc>> = None;
    for (account_id, index) in indexes {
        let table = index.table();
        indexed_at = indexed_at.max(table.built_at());
        for row in table.matching(&folded_query) {
            candidates.push((account_id.as_str(), Arc::clone(&table), row));
        }
    }

    let mut seen = HashSet::new();
    candidates.retain(|(account_id, table, row)| {
        let path = &table.rows()[*row].path;
        match checksum_from_file_name(path) {
            Some(checksum) => seen.insert(checksum.to_string()),
            None => seen.insert(format!("{account_id}/{path}")),
        }
    });
    candidates.sort_by(|a, b| b.1.rows()[b.2].date.cmp(&a.1.rows()[a.2].date));

    let total = candidates.len();
    let hits = candidates[page_range(total, offset, limit)]
        .iter()
        .map(|(account_id, table, row)| {
            let mut hit = table.hit(*row, &folded_query);
            hit.account_id = Some((*account_id).to_string());
            hit
        })
        .collect();

    SearchResults {
        query: query.to_string(),
        total,
        offset,
        limit,
        hits,
        indexed_at,
    }
}
