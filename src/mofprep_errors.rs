use thiserror::Error;

use crate::constants::{FileId, GroupId, RowIndex};

#[derive(Error, Debug)]
pub enum MofError {
    #[error("No support for weighting policy: {0}")]
    UnknownWeightPolicy(String),

    #[error("Mismatch in catalog sizes: band 0 has {expected} objects, band {band} has {found}")]
    ObjectCountMismatch {
        band: usize,
        expected: usize,
        found: usize,
    },

    #[error("Catalog number column of {0} does not match band 0 position by position")]
    NumberMismatch(String),

    #[error("Unknown FoF group: {0}")]
    UnknownGroup(GroupId),

    #[error("At least one band is required")]
    NoBands,

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Jacobian is singular (determinant {0})")]
    SingularJacobian(f64),

    #[error("Cutout unavailable for row {row}, cutout {icut}: {reason}")]
    CutoutUnavailable {
        row: RowIndex,
        icut: usize,
        reason: String,
    },

    #[error("PSF unavailable for band {band}, row {row}, cutout {icut}: {reason}")]
    PsfUnavailable {
        band: usize,
        row: RowIndex,
        icut: usize,
        reason: String,
    },

    #[error("Image {0} is not in the image table")]
    UnknownImage(FileId),

    #[error("Cannot derive an exposure/chip key from image name: {0}")]
    InvalidImageName(String),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Unable to perform file operation: {0}")]
    IoError(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Regex error: {0}")]
    RegexError(#[from] regex::Error),
}

impl MofError {
    /// `true` for the errors the observation builder degrades into a flagged observation.
    pub fn is_per_epoch(&self) -> bool {
        matches!(
            self,
            MofError::CutoutUnavailable { .. }
                | MofError::PsfUnavailable { .. }
                | MofError::SingularJacobian(_)
        )
    }
}

impl PartialEq for MofError {
    fn eq(&self, other: &Self) -> bool {
        use MofError::*;
        match (self, other) {
            (UnknownWeightPolicy(a), UnknownWeightPolicy(b)) => a == b,
            (
                ObjectCountMismatch {
                    band: a1,
                    expected: a2,
                    found: a3,
                },
                ObjectCountMismatch {
                    band: b1,
                    expected: b2,
                    found: b3,
                },
            ) => a1 == b1 && a2 == b2 && a3 == b3,
            (NumberMismatch(a), NumberMismatch(b)) => a == b,
            (UnknownGroup(a), UnknownGroup(b)) => a == b,
            (InvalidParameter(a), InvalidParameter(b)) => a == b,
            (SingularJacobian(a), SingularJacobian(b)) => a == b,
            (
                CutoutUnavailable {
                    row: a1, icut: a2, ..
                },
                CutoutUnavailable {
                    row: b1, icut: b2, ..
                },
            ) => a1 == b1 && a2 == b2,
            (
                PsfUnavailable {
                    band: a1,
                    row: a2,
                    icut: a3,
                    ..
                },
                PsfUnavailable {
                    band: b1,
                    row: b2,
                    icut: b3,
                    ..
                },
            ) => a1 == b1 && a2 == b2 && a3 == b3,
            (UnknownImage(a), UnknownImage(b)) => a == b,
            (InvalidImageName(a), InvalidImageName(b)) => a == b,
            (InvariantViolation(a), InvariantViolation(b)) => a == b,

            // not comparable: equal if same variant
            (IoError(_), IoError(_)) => true,
            (CsvError(_), CsvError(_)) => true,
            (JsonError(_), JsonError(_)) => true,
            (RegexError(_), RegexError(_)) => true,

            (NoBands, NoBands) => true,

            _ => false,
        }
    }
}
