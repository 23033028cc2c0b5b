pub mod json;
pub mod table;

use anyhow::Result;

use crate::importer::ImportJob;
use crate::indexer::{BuildReport, IndexStats};
use crate::search::SearchResults;
use crate::sync::{AccountStatus, SyncOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

impl OutputFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Table
        }
    }
}

pub fn format_search_results(format: OutputFormat, results: &SearchResults) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_search_results(results)),
        OutputFormat::Json => json::to_pretty(results),
    }
}

pub fn format_status(format: OutputFormat, statuses: &[AccountStatus]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_status(statuses)),
        OutputFormat::Json => json::to_pretty(statuses),
    }
}

pub fn format_sync_outcomes(format: OutputFormat, outcomes: &[SyncOutcome]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_sync_outcomes(outcomes)),
        OutputFormat::Json => json::to_pretty(outcomes),
    }
}

pub fn format_import(format: OutputFormat, job: &ImportJob) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_import(job)),
        OutputFormat::Json => json::to_pretty(job),
    }
}

pub fn format_build_report(format: OutputFormat, report: &BuildReport) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_build_report(report)),
        OutputFormat::Json => json::to_pretty(report),
    }
}

pub fn format_stats(format: OutputFormat, stats: &IndexStats) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_stats(stats)),
        OutputFormat::Json => json::to_pretty(stats),
    }
}
