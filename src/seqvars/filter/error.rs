//! Error type definition for the filtering pipeline.

/// Errors that abort a filtering run.
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    /// Problem with the filter configuration, raised before any record is touched.
    #[error("invalid filter configuration: {0}")]
    Configuration(String),
    /// The worker pool could not be constructed.
    #[error("could not build worker pool: {0}")]
    WorkerPool(String),
    /// Reading from the call source failed.
    #[error("error reading call source ({position}): {reason}")]
    SourceRead {
        /// Position of the offending block, `<contig>:<start>` or a marker.
        position: String,
        /// Underlying problem.
        reason: String,
    },
    /// Writing to the call sink failed.
    #[error("error writing call sink ({position}): {reason}")]
    SinkWrite {
        /// Position of the offending record.
        position: String,
        /// Underlying problem.
        reason: String,
    },
    /// A measure could not be evaluated on a call.
    #[error("error evaluating measure {name} ({position}): {reason}")]
    MeasureEvaluation {
        /// Name of the failing measure.
        name: String,
        /// Position of the offending call.
        position: String,
        /// Underlying problem.
        reason: String,
    },
}
