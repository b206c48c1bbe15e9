use thiserror::Error;

#[derive(Debug, Error)]
pub enum QuantizeError {
    #[error("sample sequence cannot be empty")]
    EmptySamples,

    #[error("candidate universe cannot be empty")]
    EmptyUniverse,

    #[error("candidate universe contains duplicate code {0}")]
    DuplicateCode(u32),

    #[error("first_pass_candidates must be at least 1")]
    ZeroCandidates,

    #[error("max_iterations must be at least 1")]
    ZeroIterations,
}
