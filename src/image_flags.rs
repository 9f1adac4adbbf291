//! # Image-quality reduction
//!
//! Survey images carry raw quality flags whose meaning changes between processing campaigns.
//! They are reduced once per processing unit to a single run-specific bit per image:
//!
//! 1. for single-epoch images (index ≥ 1 of a band's image table) the raw flags may be
//!    replaced from a [`FlagOverride`] table,
//! 2. `IMAGE_FLAGS_SET` if `(flags & flags_to_check) != 0`, else 0,
//! 3. images without a PSF model are flagged as well,
//! 4. the reference image (index 0) is always usable.
//!
//! Only the reduced bit is used downstream.
use tracing::{info, warn};

use crate::{
    constants::{FileId, IMAGE_FLAGS_SET},
    cutouts::{ImageInfo, PsfProvider},
    mofprep_errors::MofError,
    tables::{AstromFlags, ReplacementFlags},
};

/// Source of replacement flags for single-epoch images.
#[derive(Debug, Clone)]
pub enum FlagOverride {
    /// Keyed by exposure and chip, derived from the image path; missing keys take
    /// `flags_to_check` (flagged)
    Replacement(ReplacementFlags),
    /// Keyed by image id; missing ids are flagged
    Astrom(AstromFlags),
}

impl FlagOverride {
    fn replace(&self, images: &[ImageInfo], flags_to_check: i64) -> Result<Vec<i64>, MofError> {
        match self {
            FlagOverride::Replacement(table) => images
                .iter()
                .map(|im| table.flags_for(&im.image_path, flags_to_check))
                .collect(),
            FlagOverride::Astrom(table) => {
                let ids: Vec<i64> = images.iter().map(|im| im.image_id).collect();
                Ok(table.flags_multi(&ids))
            }
        }
    }
}

/// Reduced image flags of every band, indexed like the band's image table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BandImageFlags {
    flags: Vec<Vec<i64>>,
}

impl BandImageFlags {
    /// Reduce the raw flags of every band.
    ///
    /// Arguments
    /// ---------
    /// * `image_tables`: the image table of every band, reference image first
    /// * `flags_to_check`: raw bits making an image unusable
    /// * `overrides`: optional replacement of the single-epoch raw flags
    /// * `psf`: PSF provider, asked whether every usable single-epoch image has a model
    ///
    /// Return
    /// ------
    /// * The per-band arrays of 0 / `IMAGE_FLAGS_SET`.
    pub fn reduce(
        image_tables: &[&[ImageInfo]],
        flags_to_check: i64,
        overrides: Option<&FlagOverride>,
        psf: &dyn PsfProvider,
    ) -> Result<Self, MofError> {
        let mut reduced = BandImageFlags::default();

        for (band, images) in image_tables.iter().enumerate() {
            let mut raw: Vec<i64> = images.iter().map(|im| im.image_flags).collect();
            if let (Some(table), true) = (overrides, images.len() > 1) {
                info!("band {band}: replacing image flags");
                let replaced = table.replace(&images[1..], flags_to_check)?;
                raw[1..].copy_from_slice(&replaced);
            }

            let mut band_flags: Vec<i64> = raw
                .iter()
                .map(|&f| {
                    if (f & flags_to_check) != 0 {
                        IMAGE_FLAGS_SET
                    } else {
                        0
                    }
                })
                .collect();
            if let Some(first) = band_flags.first_mut() {
                *first = 0;
            }
            reduced.flags.push(band_flags);

            for file_id in 1..images.len() {
                if !reduced.is_flagged(band, file_id)? && !psf.has_model(band, file_id) {
                    warn!(
                        "missing psf model for {}, flagging image",
                        images[file_id].image_path
                    );
                    reduced.flag_image(band, file_id)?;
                }
            }

            info!(
                "band {band}: flags set for {}/{}",
                reduced.flags[band].iter().skip(1).filter(|&&f| f != 0).count(),
                images.len().saturating_sub(1)
            );
        }

        Ok(reduced)
    }

    pub fn nband(&self) -> usize {
        self.flags.len()
    }

    pub fn band(&self, band: usize) -> &[i64] {
        self.flags.get(band).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_flagged(&self, band: usize, file_id: FileId) -> Result<bool, MofError> {
        self.band(band)
            .get(file_id)
            .map(|&f| f != 0)
            .ok_or(MofError::UnknownImage(file_id))
    }

    /// Mark an image unusable.
    pub fn flag_image(&mut self, band: usize, file_id: FileId) -> Result<(), MofError> {
        let slot = self
            .flags
            .get_mut(band)
            .and_then(|flags| flags.get_mut(file_id))
            .ok_or(MofError::UnknownImage(file_id))?;
        *slot = IMAGE_FLAGS_SET;
        Ok(())
    }

    /// Reduced flags of the given images, in order.
    pub fn cutout_flags(&self, band: usize, file_ids: &[FileId]) -> Result<Vec<i64>, MofError> {
        let flags = self.band(band);
        file_ids
            .iter()
            .map(|&id| flags.get(id).copied().ok_or(MofError::UnknownImage(id)))
            .collect()
    }
}
