use thiserror::Error;

/// Invalid configuration or input shapes. These are never retried.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("variant {0:?} has no generation time distribution")]
    MissingVariant(String),
    #[error("generation time weights must be nonnegative and sum to one")]
    InvalidWeights,
    #[error("reproduction numbers have length {r} but introductions have length {intros}")]
    ShapeMismatch { r: usize, intros: usize },
    /// The shape mismatch between a generation kernel and the introduction
    /// history it convolves, kept apart from `ShapeMismatch` so the two
    /// lengths can be reported.
    #[error("kernel of length {kernel} exceeds the {history} steps of usable history")]
    KernelTooLong { kernel: usize, history: usize },
    #[error("{name} must be nonnegative, got {value}")]
    Negative { name: &'static str, value: i64 },
    #[error("model data is missing augmentation field {0:?}")]
    MissingAugmentation(&'static str),
    #[error("invalid model data: {0}")]
    InvalidData(String),
    #[error("invalid model option: {0}")]
    InvalidOption(String),
}
