//! Error types for destination resolution (spec §7). Modeled as a single
//! `thiserror`-derived enum rather than the reference tree's two-enum split
//! (`ErrorCategory` + `CategorizedError`), since unlike HTTP status codes
//! this domain has a small, closed set of failure shapes.

use thiserror::Error;

use crate::queue::Problem;

/// Errors a resolution attempt can surface to its caller. Probe failures
/// (spec §7.1) are never represented here — they are problems attached to
/// the result sink, not fatal errors.
#[derive(Error, Debug)]
pub enum ResolutionError {
    /// A selector returned `None`, or a node name outside what it was handed
    /// (spec §7.3).
    #[error("selector returned an invalid or unknown node for invocation of {app}/{module}")]
    InvalidSelectorResult { app: String, module: String },

    /// The consumer's wait on the services queue was cancelled (spec §5/§7.5).
    #[error("discovery was interrupted before a destination could be resolved")]
    Interrupted,

    /// A destination was selected but turned out to be wrong at RPC time
    /// (spec §4.E post-invocation handling); the caller should retry.
    #[error("destination {destination} is no longer valid; retry requested")]
    TargetMissing { destination: String },
}

impl ResolutionError {
    /// Problems accumulated during discovery, attached to this error as the
    /// reference tree attaches suppressed exceptions (spec §7).
    pub fn with_suppressed(self, problems: &[Problem]) -> SuppressingError {
        SuppressingError {
            source: self,
            problems: problems.to_vec(),
        }
    }
}

/// A [`ResolutionError`] plus the discovery problems that were accumulated
/// alongside it (spec §7: "problems ... are always attached as suppressed
/// exceptions to any exception the invocation ultimately raises").
#[derive(Error, Debug)]
#[error("{source}")]
pub struct SuppressingError {
    #[source]
    pub source: ResolutionError,
    pub problems: Vec<Problem>,
}
