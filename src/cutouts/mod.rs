//! # Cutout data collaborators
//!
//! The assembly pipeline never reads a storage format directly. Everything it needs from
//! the survey products goes through three small capability traits:
//!
//! * [`CutoutSource`] – one per band: object catalog rows, per-cutout geometry, the band's
//!   image table and the pixel / weight / segmentation / bitmask cutouts.
//! * [`PsfProvider`] – a PSF stamp for `(band, row, cutout)`.
//! * [`SkyMap`] – mosaic pixel → sky conversion, needed for off-chip neighbors.
//!
//! Format- or era-specific behavior is injected by implementing these traits, not by
//! specializing the pipeline. In-memory implementations live in [`memory`].
//!
//! ## Indexing
//!
//! ```text
//! row  : 0-offset position of the object in the band catalog (identical across bands)
//! icut : cutout slot of the object, 0 = reference/coadd, 1.. = single epochs
//! file : index in the band's image table, 0 = reference/coadd image
//! ```

pub mod memory;

use crate::{
    constants::{Degree, FileId, Image, IntImage, ObjectId, ObjectNumber, RowIndex},
    jacobian::Jacobian,
    mofprep_errors::MofError,
};

/// Catalog-level description of one object in one band.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectInfo {
    pub id: ObjectId,
    pub number: ObjectNumber,
    /// Number of cutouts, reference included
    pub ncutout: usize,
    /// Side of the square cutouts, in pixels
    pub box_size: usize,
}

/// Geometry of one cutout of one object.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochInfo {
    /// Index of the originating image in the band's image table
    pub file_id: FileId,
    /// Position of the object in the originating image
    pub orig_row: f64,
    pub orig_col: f64,
    /// Position of the cutout's first pixel in the originating image
    pub orig_start_row: f64,
    pub orig_start_col: f64,
    /// Local pixel → sky map, centered on the object within the cutout
    pub jacobian: Jacobian,
}

/// One entry of a band's image table.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageInfo {
    pub image_path: String,
    pub image_id: i64,
    /// Raw survey quality flags
    pub image_flags: i64,
}

/// Which inverse-variance map to read for a cutout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WeightKind {
    /// Plain weight map of the image
    Weight,
    /// Weight combined with the segmentation map, other objects' pixels zeroed
    SegAware,
    /// Seg-aware weight built from the nearest-object assignment
    SegAwareNearest,
}

/// A PSF image returned by a [`PsfProvider`].
#[derive(Debug, Clone, PartialEq)]
pub struct PsfStamp {
    pub image: Image,
    /// Center of the PSF in stamp pixels `(row, col)`
    pub center: (f64, f64),
    /// Characteristic width in pixels
    pub sigma_pix: f64,
    /// Free-form label, for debugging (usually the PSF file name)
    pub label: String,
}

pub trait CutoutSource: Send + Sync {
    fn num_objects(&self) -> usize;

    fn object_info(&self, row: RowIndex) -> ObjectInfo;

    fn epoch_info(&self, row: RowIndex, icut: usize) -> Result<EpochInfo, MofError>;

    fn image_info(&self) -> &[ImageInfo];

    fn fetch_image(&self, row: RowIndex, icut: usize) -> Result<Image, MofError>;

    fn fetch_weight(&self, row: RowIndex, icut: usize, kind: WeightKind)
        -> Result<Image, MofError>;

    fn fetch_seg(&self, row: RowIndex, icut: usize) -> Result<IntImage, MofError>;

    fn fetch_bmask(&self, row: RowIndex, icut: usize) -> Result<IntImage, MofError>;

    /// Catalog numbers of every row, in row order.
    fn numbers(&self) -> Vec<ObjectNumber> {
        (0..self.num_objects())
            .map(|row| self.object_info(row).number)
            .collect()
    }

    /// Image-table indices of the cutouts of `row`, in cutout order.
    fn file_ids(&self, row: RowIndex) -> Result<Vec<FileId>, MofError> {
        (0..self.object_info(row).ncutout)
            .map(|icut| self.epoch_info(row, icut).map(|e| e.file_id))
            .collect()
    }
}

pub trait PsfProvider: Send + Sync {
    fn psf_stamp(&self, band: usize, row: RowIndex, icut: usize) -> Result<PsfStamp, MofError>;

    /// Whether a PSF model exists for image `file_id` of `band`.
    ///
    /// Checked once per image when image flags are reduced; images without a model are
    /// flagged unusable.
    fn has_model(&self, _band: usize, _file_id: FileId) -> bool {
        true
    }
}

pub trait SkyMap: Send + Sync {
    /// Sky position `(ra, dec)` in degrees of a 0-offset position in image `file_id` of `band`,
    /// `None` when no astrometric solution is known for that image.
    fn image_to_sky(
        &self,
        band: usize,
        file_id: FileId,
        row: f64,
        col: f64,
    ) -> Option<(Degree, Degree)>;
}
