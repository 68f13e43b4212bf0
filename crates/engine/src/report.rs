//! Run report: per-kind success/failure counts, warnings and final status.

use std::collections::BTreeMap;
use std::fmt;

use kcopy_core::{CopyError, CopyResult, Direction, ResourceCoordinate};
use kcopy_order::Wave;
use serde::Serialize;

/// Errors kept per kind; the rest are only counted.
pub const MAX_KIND_ERRORS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    Success,
    PartialFailure,
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Success => f.write_str("success"),
            RunStatus::PartialFailure => f.write_str("partial failure"),
            RunStatus::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KindSummary {
    /// Kind name, or the raw token when resolution failed.
    pub kind: String,
    pub coordinate: Option<ResourceCoordinate>,
    pub succeeded: usize,
    pub failed: usize,
    pub first_errors: Vec<String>,
}

impl KindSummary {
    fn new(kind: String, coordinate: Option<ResourceCoordinate>) -> Self {
        Self { kind, coordinate, succeeded: 0, failed: 0, first_errors: Vec::new() }
    }

    fn record_error(&mut self, err: String) {
        self.failed += 1;
        if self.first_errors.len() < MAX_KIND_ERRORS {
            self.first_errors.push(err);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub direction: Direction,
    pub status: RunStatus,
    pub kinds: Vec<KindSummary>,
    pub warnings: Vec<String>,
    /// Upload waves in execution order; empty for downloads.
    pub waves: Vec<Wave>,
}

impl RunReport {
    pub fn succeeded(&self) -> usize { self.kinds.iter().map(|k| k.succeeded).sum() }

    pub fn failed(&self) -> usize { self.kinds.iter().map(|k| k.failed).sum() }

    pub fn kind(&self, kind: &str) -> Option<&KindSummary> { self.kinds.iter().find(|k| k.kind == kind) }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum SummaryKey {
    Coordinate(ResourceCoordinate),
    Token(String),
}

/// Accumulates results as batches complete.
#[derive(Debug)]
pub(crate) struct ReportBuilder {
    direction: Direction,
    kinds: BTreeMap<SummaryKey, KindSummary>,
    warnings: Vec<String>,
    waves: Vec<Wave>,
    cancelled: bool,
}

impl ReportBuilder {
    pub(crate) fn new(direction: Direction) -> Self {
        Self { direction, kinds: BTreeMap::new(), warnings: Vec::new(), waves: Vec::new(), cancelled: false }
    }

    /// Make sure a kind shows up even when it had no objects.
    pub(crate) fn touch(&mut self, coordinate: &ResourceCoordinate, kind: &str) -> &mut KindSummary {
        self.kinds
            .entry(SummaryKey::Coordinate(coordinate.clone()))
            .or_insert_with(|| KindSummary::new(kind.to_string(), Some(coordinate.clone())))
    }

    /// A token that never resolved.
    pub(crate) fn token_failed(&mut self, token: &str, err: &CopyError) {
        self.kinds
            .entry(SummaryKey::Token(token.to_string()))
            .or_insert_with(|| KindSummary::new(token.to_string(), None))
            .record_error(err.to_string());
    }

    /// A whole kind failed before any task ran (e.g. list error).
    pub(crate) fn kind_failed(&mut self, coordinate: &ResourceCoordinate, kind: &str, err: &CopyError) {
        self.touch(coordinate, kind).record_error(err.to_string());
    }

    pub(crate) fn absorb(&mut self, kind_of: impl Fn(&ResourceCoordinate) -> String, results: Vec<CopyResult>) {
        for r in results {
            if matches!(r.error, Some(CopyError::Cancelled)) {
                self.cancelled = true;
            }
            let kind = kind_of(&r.task.coordinate);
            let summary = self.touch(&r.task.coordinate, &kind);
            match r.error {
                None => summary.succeeded += 1,
                Some(e) => summary.record_error(format!("{}: {e}", r.task.object_key())),
            }
        }
    }

    pub(crate) fn warn(&mut self, warning: String) { self.warnings.push(warning); }

    pub(crate) fn wave(&mut self, wave: Wave) { self.waves.push(wave); }

    pub(crate) fn cancelled(&mut self) { self.cancelled = true; }

    pub(crate) fn finish(self) -> RunReport {
        let kinds: Vec<KindSummary> = self.kinds.into_values().collect();
        let status = if self.cancelled {
            RunStatus::Cancelled
        } else if kinds.iter().any(|k| k.failed > 0) {
            RunStatus::PartialFailure
        } else {
            RunStatus::Success
        };
        RunReport { direction: self.direction, status, kinds, warnings: self.warnings, waves: self.waves }
    }
}
