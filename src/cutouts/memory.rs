//! In-memory collaborators: catalogs held in `Vec`s and analytic Gaussian PSFs.
//!
//! These implement the [`CutoutSource`] and [`PsfProvider`] traits without any file
//! format. They back the crate's tests and are handy for simulations.
use std::collections::{HashMap, HashSet};

use nalgebra::DMatrix;

use crate::{
    constants::{FileId, Image, IntImage, RowIndex},
    mofprep_errors::MofError,
};

use super::{
    CutoutSource, EpochInfo, ImageInfo, ObjectInfo, PsfProvider, PsfStamp, WeightKind,
};

/// Pixel content of a cutout.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochPixels {
    pub image: Image,
    pub weights: HashMap<WeightKind, Image>,
    pub seg: IntImage,
    pub bmask: IntImage,
}

impl EpochPixels {
    /// Pixels with the same weight map for every [`WeightKind`] and an empty bitmask.
    pub fn new(image: Image, weight: Image, seg: IntImage) -> Self {
        let bmask = IntImage::zeros(image.nrows(), image.ncols());
        let weights = [
            WeightKind::Weight,
            WeightKind::SegAware,
            WeightKind::SegAwareNearest,
        ]
        .into_iter()
        .map(|kind| (kind, weight.clone()))
        .collect();
        EpochPixels {
            image,
            weights,
            seg,
            bmask,
        }
    }

    pub fn with_weight(mut self, kind: WeightKind, weight: Image) -> Self {
        self.weights.insert(kind, weight);
        self
    }

    pub fn with_bmask(mut self, bmask: IntImage) -> Self {
        self.bmask = bmask;
        self
    }
}

/// One cutout: its geometry and, unless the file is missing, its pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryEpoch {
    pub info: EpochInfo,
    pub pixels: Option<EpochPixels>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryObject {
    pub info: ObjectInfo,
    pub epochs: Vec<MemoryEpoch>,
}

/// A band catalog held entirely in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryCutouts {
    objects: Vec<MemoryObject>,
    images: Vec<ImageInfo>,
}

impl MemoryCutouts {
    pub fn new(images: Vec<ImageInfo>) -> Self {
        MemoryCutouts {
            objects: Vec::new(),
            images,
        }
    }

    /// Append an object; its `ncutout` is taken from the number of epochs given.
    pub fn push_object(&mut self, mut info: ObjectInfo, epochs: Vec<MemoryEpoch>) -> RowIndex {
        info.ncutout = epochs.len();
        self.objects.push(MemoryObject { info, epochs });
        self.objects.len() - 1
    }

    pub fn object_mut(&mut self, row: RowIndex) -> Option<&mut MemoryObject> {
        self.objects.get_mut(row)
    }

    pub fn images_mut(&mut self) -> &mut Vec<ImageInfo> {
        &mut self.images
    }

    fn pixels(&self, row: RowIndex, icut: usize) -> Result<&EpochPixels, MofError> {
        self.epoch(row, icut)?
            .pixels
            .as_ref()
            .ok_or_else(|| MofError::CutoutUnavailable {
                row,
                icut,
                reason: "no pixel data".into(),
            })
    }

    fn epoch(&self, row: RowIndex, icut: usize) -> Result<&MemoryEpoch, MofError> {
        self.objects
            .get(row)
            .and_then(|obj| obj.epochs.get(icut))
            .ok_or_else(|| MofError::CutoutUnavailable {
                row,
                icut,
                reason: "no such cutout".into(),
            })
    }
}

impl CutoutSource for MemoryCutouts {
    fn num_objects(&self) -> usize {
        self.objects.len()
    }

    fn object_info(&self, row: RowIndex) -> ObjectInfo {
        self.objects[row].info.clone()
    }

    fn epoch_info(&self, row: RowIndex, icut: usize) -> Result<EpochInfo, MofError> {
        Ok(self.epoch(row, icut)?.info.clone())
    }

    fn image_info(&self) -> &[ImageInfo] {
        &self.images
    }

    fn fetch_image(&self, row: RowIndex, icut: usize) -> Result<Image, MofError> {
        Ok(self.pixels(row, icut)?.image.clone())
    }

    fn fetch_weight(
        &self,
        row: RowIndex,
        icut: usize,
        kind: WeightKind,
    ) -> Result<Image, MofError> {
        self.pixels(row, icut)?
            .weights
            .get(&kind)
            .cloned()
            .ok_or_else(|| MofError::CutoutUnavailable {
                row,
                icut,
                reason: format!("no {kind:?} weight map"),
            })
    }

    fn fetch_seg(&self, row: RowIndex, icut: usize) -> Result<IntImage, MofError> {
        Ok(self.pixels(row, icut)?.seg.clone())
    }

    fn fetch_bmask(&self, row: RowIndex, icut: usize) -> Result<IntImage, MofError> {
        Ok(self.pixels(row, icut)?.bmask.clone())
    }
}

/// Circular Gaussian PSF stamps, one width per band.
#[derive(Debug, Clone)]
pub struct GaussianPsf {
    sigma_pix: Vec<f64>,
    stamp_size: usize,
    missing: HashSet<(usize, RowIndex, usize)>,
    missing_models: HashSet<(usize, FileId)>,
}

impl GaussianPsf {
    pub fn new(sigma_pix: Vec<f64>, stamp_size: usize) -> Self {
        GaussianPsf {
            sigma_pix,
            stamp_size,
            missing: HashSet::new(),
            missing_models: HashSet::new(),
        }
    }

    /// Make `psf_stamp(band, row, icut)` fail, as for an unreadable PSF file.
    pub fn mark_missing(&mut self, band: usize, row: RowIndex, icut: usize) {
        self.missing.insert((band, row, icut));
    }

    /// Report image `file_id` of `band` as having no PSF model at all.
    pub fn mark_missing_model(&mut self, band: usize, file_id: FileId) {
        self.missing_models.insert((band, file_id));
    }

    fn render(&self, sigma: f64) -> Image {
        let cen = (self.stamp_size as f64 - 1.0) / 2.0;
        let norm = 1.0 / (2.0 * std::f64::consts::PI * sigma * sigma);
        DMatrix::from_fn(self.stamp_size, self.stamp_size, |r, c| {
            let dr = r as f64 - cen;
            let dc = c as f64 - cen;
            norm * (-(dr * dr + dc * dc) / (2.0 * sigma * sigma)).exp()
        })
    }
}

impl PsfProvider for GaussianPsf {
    fn psf_stamp(&self, band: usize, row: RowIndex, icut: usize) -> Result<PsfStamp, MofError> {
        let unavailable = |reason: &str| MofError::PsfUnavailable {
            band,
            row,
            icut,
            reason: reason.to_string(),
        };
        if self.missing.contains(&(band, row, icut)) {
            return Err(unavailable("missing psf file"));
        }
        let sigma = *self
            .sigma_pix
            .get(band)
            .ok_or_else(|| unavailable("no psf width for band"))?;
        let cen = (self.stamp_size as f64 - 1.0) / 2.0;
        Ok(PsfStamp {
            image: self.render(sigma),
            center: (cen, cen),
            sigma_pix: sigma,
            label: format!("gauss-b{band}-r{row}-c{icut}"),
        })
    }

    fn has_model(&self, band: usize, file_id: FileId) -> bool {
        !self.missing_models.contains(&(band, file_id))
    }
}

#[cfg(test)]
mod memory_test {
    use super::*;
    use crate::jacobian::Jacobian;
    use approx::assert_relative_eq;

    fn one_object() -> MemoryCutouts {
        let mut cutouts = MemoryCutouts::new(vec![ImageInfo {
            image_path: "coadd.fits".into(),
            image_id: 10,
            image_flags: 0,
        }]);
        let jac = Jacobian::new(2.0, 2.0, 0.0, 0.27, 0.27, 0.0).unwrap();
        let epoch = MemoryEpoch {
            info: EpochInfo {
                file_id: 0,
                orig_row: 102.0,
                orig_col: 52.0,
                orig_start_row: 100.0,
                orig_start_col: 50.0,
                jacobian: jac,
            },
            pixels: Some(EpochPixels::new(
                Image::from_element(5, 5, 1.0),
                Image::from_element(5, 5, 4.0),
                IntImage::zeros(5, 5),
            )),
        };
        cutouts.push_object(
            ObjectInfo {
                id: 7,
                number: 1,
                ncutout: 0,
                box_size: 5,
            },
            vec![epoch],
        );
        cutouts
    }

    #[test]
    fn test_push_object_sets_ncutout() {
        let cutouts = one_object();
        assert_eq!(cutouts.num_objects(), 1);
        assert_eq!(cutouts.object_info(0).ncutout, 1);
        assert_eq!(cutouts.numbers(), vec![1]);
        assert_eq!(cutouts.file_ids(0).unwrap(), vec![0]);
    }

    #[test]
    fn test_missing_cutout() {
        let cutouts = one_object();
        let err = cutouts.fetch_image(0, 3).unwrap_err();
        assert!(err.is_per_epoch());
        assert_eq!(
            err,
            MofError::CutoutUnavailable {
                row: 0,
                icut: 3,
                reason: String::new()
            }
        );
    }

    #[test]
    fn test_gaussian_psf_is_normalized() {
        let mut psf = GaussianPsf::new(vec![1.5], 25);
        let stamp = psf.psf_stamp(0, 0, 0).unwrap();
        assert_relative_eq!(stamp.image.sum(), 1.0, epsilon = 1e-6);
        assert_eq!(stamp.center, (12.0, 12.0));

        psf.mark_missing(0, 0, 1);
        assert!(psf.psf_stamp(0, 0, 1).is_err());
        assert!(psf.psf_stamp(1, 0, 0).is_err());

        assert!(psf.has_model(0, 4));
        psf.mark_missing_model(0, 4);
        assert!(!psf.has_model(0, 4));
    }
}
