use thiserror::Error;

/// Structural and addressing errors that library callers can match on.
///
/// Protocol violations encountered mid-session are not represented here:
/// they are fatal to the whole serial exchange and are reported as
/// `eyre::Report` by [`crate::fdcemu`], same as the protocol-level `bail!`s
/// they replace.
#[derive(Debug, Error)]
pub enum KnittyError {
    #[error("sector index {0} out of bounds (must be < {1})")]
    SectorIndexOutOfBounds(usize, usize),

    #[error("expected {expected} bytes for {what}, got {got}")]
    WrongSize {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("BCD nibble {0:x} exceeds 9 in strict mode")]
    InvalidBcdDigit(u8),

    #[error("pattern number {0} out of range 1..=999")]
    InvalidPatternNumber(u16),

    #[error("pattern row length mismatch: expected width {expected}, got {got}")]
    RowWidthMismatch { expected: usize, got: usize },

    #[error("pattern row count mismatch: expected height {expected}, got {got}")]
    RowCountMismatch { expected: usize, got: usize },

    #[error("too many patterns: {0} exceeds the {1}-pattern limit")]
    TooManyPatterns(usize, usize),
}

pub type Result<T> = std::result::Result<T, KnittyError>;
