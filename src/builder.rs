//! # Observation builder
//!
//! Turns the raw cutouts of one object into the observation model of
//! [`crate::observations`].
//!
//! For every band and every cutout slot of the object (slot 0 = reference image):
//!
//! * an image flagged by the [`BandImageFlags`] reduction gives an empty observation with
//!   status [`IMAGE_FLAGS`],
//! * otherwise image, weight(s), segmentation map, Jacobian and PSF are fetched, weights below
//!   `min_weight` are set to zero and negative weights are clipped; a per-epoch fetch failure
//!   degrades to the same flagged empty observation,
//! * positional meta-data is filled in both cases.
//!
//! When every cutout of a band is built, the good single epochs go through
//! [`reject_outliers`].
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::{
    constants::{Image, RowIndex, IMAGE_FLAGS},
    cutouts::{CutoutSource, EpochInfo, PsfProvider},
    image_flags::BandImageFlags,
    mofprep_errors::MofError,
    observations::{MultiBandObsList, ObsList, Observation, PsfObservation},
    params::AssemblyParams,
};

pub struct ObservationBuilder<'a> {
    sources: &'a [Arc<dyn CutoutSource>],
    psf: &'a dyn PsfProvider,
    image_flags: &'a BandImageFlags,
    params: &'a AssemblyParams,
}

impl<'a> ObservationBuilder<'a> {
    pub fn new(
        sources: &'a [Arc<dyn CutoutSource>],
        psf: &'a dyn PsfProvider,
        image_flags: &'a BandImageFlags,
        params: &'a AssemblyParams,
    ) -> Self {
        ObservationBuilder {
            sources,
            psf,
            image_flags,
            params,
        }
    }

    /// Build the reference and single-epoch views of the object at `row`.
    ///
    /// Return
    /// ------
    /// * `(reference, epochs)`: one [`ObsList`] per band in each view. Per-epoch failures
    ///   are absorbed into flagged observations; only configuration or invariant errors
    ///   are returned.
    pub fn build(&self, row: RowIndex) -> Result<(MultiBandObsList, MultiBandObsList), MofError> {
        let first = self.sources.first().ok_or(MofError::NoBands)?;
        let info = first.object_info(row);
        let nband = self.sources.len();

        let mut coadd = MultiBandObsList::new(info.id, info.number, row, nband);
        let mut epochs = MultiBandObsList::new(info.id, info.number, row, nband);

        for band in 0..nband {
            let (coadd_list, epoch_list) = self.build_band(band, row)?;
            let nimage = self.sources[band].object_info(row).ncutout as i32 - 1;
            coadd.meta.nimage_tot[band] = nimage;
            epochs.meta.nimage_tot[band] = nimage;
            coadd.bands.push(coadd_list);
            epochs.bands.push(epoch_list);
        }

        debug!(
            "built object id {} (row {row}): {} reference / {} single-epoch observations",
            info.id,
            coadd.iter_obs().count(),
            epochs.iter_obs().count()
        );
        Ok((coadd, epochs))
    }

    fn build_band(&self, band: usize, row: RowIndex) -> Result<(ObsList, ObsList), MofError> {
        let source = &self.sources[band];
        let ncutout = source.object_info(row).ncutout;

        let mut coadd_list = ObsList::with_capacity(1);
        let mut obs_list = ObsList::with_capacity(ncutout.saturating_sub(1));

        for icut in 0..ncutout {
            let obs = self.build_one(band, row, icut)?;
            if icut == 0 {
                coadd_list.push(obs);
            } else {
                obs_list.push(obs);
            }
        }

        if self.params.normalize_pixel_scale {
            coadd_list
                .iter_mut()
                .chain(obs_list.iter_mut())
                .filter(|obs| obs.is_good())
                .for_each(normalize_pixel_scale);
        }

        if self.params.reject_outliers && obs_list.iter().any(Observation::is_good) {
            let nreject =
                reject_outliers(&mut obs_list, self.params.outlier_nsigma, self.params.outlier_a);
            if nreject > 0 {
                debug!("band {band}, row {row}: rejected {nreject} outlier pixels");
            }
        }

        Ok((coadd_list, obs_list))
    }

    fn build_one(&self, band: usize, row: RowIndex, icut: usize) -> Result<Observation, MofError> {
        let source = &self.sources[band];
        let epoch = match source.epoch_info(row, icut) {
            Ok(epoch) => epoch,
            Err(err) if err.is_per_epoch() => {
                warn!("band {band}: {err}");
                return Ok(Observation::flagged(icut, IMAGE_FLAGS));
            }
            Err(err) => return Err(err),
        };

        let mut obs = if self.image_flags.is_flagged(band, epoch.file_id)? {
            Observation::flagged(icut, IMAGE_FLAGS)
        } else {
            match self.fetch_observation(band, row, icut, &epoch) {
                Ok(obs) => obs,
                Err(err) if err.is_per_epoch() => {
                    warn!("band {band}: {err}, flagging epoch");
                    Observation::flagged(icut, IMAGE_FLAGS)
                }
                Err(err) => return Err(err),
            }
        };

        self.fill_meta(&mut obs, band, row, icut, &epoch)?;
        Ok(obs)
    }

    fn fetch_observation(
        &self,
        band: usize,
        row: RowIndex,
        icut: usize,
        epoch: &EpochInfo,
    ) -> Result<Observation, MofError> {
        let source = &self.sources[band];
        let policy = self.params.weight_policy;
        let min_weight = self.params.min_weight;

        let image = source.fetch_image(row, icut)?;

        let mut weight = source.fetch_weight(row, icut, policy.primary())?;
        floor_weight(&mut weight, min_weight);
        // negative weights break the PSF fitting code downstream
        weight.apply(|w| *w = w.max(0.0));

        let weight_us = match policy.unsmoothed() {
            Some(kind) => {
                let mut wt = source.fetch_weight(row, icut, kind)?;
                floor_weight(&mut wt, min_weight);
                Some(wt)
            }
            None => None,
        };

        let seg = source.fetch_seg(row, icut)?;
        let bmask = if self.params.propagate_sat_starpix || self.params.flag_stellar_halo {
            Some(source.fetch_bmask(row, icut)?)
        } else {
            None
        };

        let shape = image.shape();
        let consistent = weight.shape() == shape
            && seg.shape() == shape
            && weight_us.as_ref().map_or(true, |w| w.shape() == shape)
            && bmask.as_ref().map_or(true, |m| m.shape() == shape);
        if !consistent {
            return Err(MofError::CutoutUnavailable {
                row,
                icut,
                reason: "pixel grids of different shapes".into(),
            });
        }

        let jacobian = epoch.jacobian.clone();
        let psf = PsfObservation::from_stamp(self.psf.psf_stamp(band, row, icut)?, &jacobian);

        let mut obs = Observation::flagged(icut, 0);
        obs.image = image;
        obs.weight_raw = weight.clone();
        obs.weight = weight;
        obs.weight_us = weight_us;
        obs.seg = seg;
        obs.bmask = bmask;
        obs.jacobian = jacobian;
        obs.psf = Some(psf);
        Ok(obs)
    }

    fn fill_meta(
        &self,
        obs: &mut Observation,
        band: usize,
        row: RowIndex,
        icut: usize,
        epoch: &EpochInfo,
    ) -> Result<(), MofError> {
        let source = &self.sources[band];
        let info = source.object_info(row);
        let image = source
            .image_info()
            .get(epoch.file_id)
            .ok_or(MofError::UnknownImage(epoch.file_id))?;

        obs.icut = icut;
        obs.has_epoch_info = true;
        obs.file_id = epoch.file_id;
        obs.orig_row = epoch.orig_row;
        obs.orig_col = epoch.orig_col;
        obs.orig_start_row = epoch.orig_start_row;
        obs.orig_start_col = epoch.orig_start_col;
        obs.filename = image.image_path.clone();

        let meta = &mut obs.meta;
        meta.id = info.id;
        meta.number = info.number;
        meta.band_num = band as i16;
        meta.cutout_index = icut as i32;
        meta.orig_row = epoch.orig_row;
        meta.orig_col = epoch.orig_col;
        meta.file_id = epoch.file_id as i32;
        meta.pixel_scale = obs.jacobian.scale();
        meta.image_id = image.image_id;
        Ok(())
    }
}

fn floor_weight(weight: &mut Image, min_weight: f64) {
    weight.apply(|w| {
        if *w < min_weight {
            *w = 0.0
        }
    });
}

/// Convert a good observation to per-arcsec² units: image / area, weights · area².
pub fn normalize_pixel_scale(obs: &mut Observation) {
    let area = obs.jacobian.area();
    let area2 = area * area;
    obs.image /= area;
    obs.weight *= area2;
    obs.weight_raw *= area2;
    if let Some(wt) = obs.weight_us.as_mut() {
        *wt *= area2;
    }
}

/// Zero the weight of outlier pixels across the good epochs of one band.
///
/// The per-pixel median of the good epochs is the reference. A pixel of epoch `i` is an
/// outlier when
///
/// ```text
/// χ² = w·(im − med)² / (1 + A²·w·med²) > nsigma²
/// ```
///
/// Only `weight` is modified; `weight_raw` keeps the map as read. Flagged epochs, and epochs
/// whose shape differs from the first good one, take no part.
///
/// Return
/// ------
/// * the number of pixels rejected
pub fn reject_outliers(obs_list: &mut [Observation], nsigma: f64, a: f64) -> usize {
    let Some(shape) = obs_list.iter().find(|o| o.is_good()).map(Observation::shape) else {
        return 0;
    };
    let stack: Vec<usize> = obs_list
        .iter()
        .enumerate()
        .filter(|(_, o)| o.is_good() && o.shape() == shape)
        .map(|(i, _)| i)
        .collect();

    let (nrows, ncols) = shape;
    let median = Image::from_fn(nrows, ncols, |r, c| {
        let mut values: SmallVec<[f64; 16]> =
            stack.iter().map(|&i| obs_list[i].image[(r, c)]).collect();
        values.sort_by(f64::total_cmp);
        let n = values.len();
        if n % 2 == 1 {
            values[n / 2]
        } else {
            0.5 * (values[n / 2 - 1] + values[n / 2])
        }
    });

    let a2 = a * a;
    let threshold = nsigma * nsigma;
    let mut nreject = 0;
    for &i in &stack {
        let obs = &mut obs_list[i];
        for (idx, wt) in obs.weight.iter_mut().enumerate() {
            *wt = wt.max(0.0);
            let med = median[idx];
            let diff = obs.image[idx] - med;
            let chi2 = *wt * diff * diff / (1.0 + a2 * *wt * med * med);
            if chi2 > threshold {
                *wt = 0.0;
                nreject += 1;
            }
        }
    }
    nreject
}

#[cfg(test)]
mod builder_test {
    use super::*;
    use crate::{
        constants::IntImage,
        cutouts::{
            memory::{EpochPixels, GaussianPsf, MemoryCutouts, MemoryEpoch},
            ImageInfo, ObjectInfo, WeightKind,
        },
        jacobian::Jacobian,
        params::WeightPolicy,
    };
    use approx::assert_relative_eq;

    fn good(image: Image, weight: f64) -> Observation {
        let (nr, nc) = image.shape();
        let mut obs = Observation::flagged(1, 0);
        obs.weight = Image::from_element(nr, nc, weight);
        obs.weight_raw = obs.weight.clone();
        obs.seg = IntImage::zeros(nr, nc);
        obs.image = image;
        obs
    }

    #[test]
    fn test_reject_outliers_hits_only_the_outlier() {
        let mut hot = Image::from_element(3, 3, 10.0);
        hot[(1, 1)] = 500.0;
        let mut list = vec![
            good(Image::from_element(3, 3, 10.0), 1.0),
            good(Image::from_element(3, 3, 10.5), 1.0),
            good(hot, 1.0),
            Observation::flagged(4, IMAGE_FLAGS),
        ];
        let n = reject_outliers(&mut list, 5.0, 0.3);
        assert_eq!(n, 1);
        assert_eq!(list[2].weight[(1, 1)], 0.0);
        assert_eq!(list[2].weight_raw[(1, 1)], 1.0);
        assert_eq!(list[2].weight[(0, 0)], 1.0);
        assert_eq!(list[0].weight[(1, 1)], 1.0);
        assert_eq!(list[3].shape(), (0, 0));
    }

    #[test]
    fn test_reject_outliers_single_epoch_is_noop() {
        let mut list = vec![good(Image::from_element(2, 2, 3.0), 4.0)];
        assert_eq!(reject_outliers(&mut list, 5.0, 0.3), 0);
        assert_eq!(reject_outliers(&mut [], 5.0, 0.3), 0);
    }

    #[test]
    fn test_normalize_pixel_scale() {
        let mut obs = good(Image::from_element(2, 2, 1.0), 1.0);
        obs.jacobian = Jacobian::new(0.0, 0.0, 0.0, 0.5, 0.5, 0.0).unwrap();
        normalize_pixel_scale(&mut obs);
        assert_relative_eq!(obs.image[(0, 0)], 4.0);
        assert_relative_eq!(obs.weight[(0, 0)], 0.0625);
        assert_relative_eq!(obs.weight_raw[(1, 1)], 0.0625);
    }

    fn source() -> MemoryCutouts {
        let images = vec![
            ImageInfo {
                image_path: "coadd.fits".into(),
                image_id: 1,
                image_flags: 0,
            },
            ImageInfo {
                image_path: "se_1.fits".into(),
                image_id: 2,
                image_flags: 0,
            },
            ImageInfo {
                image_path: "se_2.fits".into(),
                image_id: 3,
                image_flags: 8,
            },
        ];
        let mut cutouts = MemoryCutouts::new(images);
        let jac = Jacobian::new(2.0, 2.0, 0.0, 0.263, 0.263, 0.0).unwrap();
        let mut weight = Image::from_element(5, 5, 2.0);
        weight[(0, 0)] = -1.0;
        weight[(0, 1)] = 0.05;
        let epochs = (0..3)
            .map(|file_id| MemoryEpoch {
                info: EpochInfo {
                    file_id,
                    orig_row: 100.0 + file_id as f64,
                    orig_col: 200.0,
                    orig_start_row: 98.0 + file_id as f64,
                    orig_start_col: 198.0,
                    jacobian: jac.clone(),
                },
                pixels: Some(
                    EpochPixels::new(
                        Image::from_element(5, 5, 1.0),
                        weight.clone(),
                        IntImage::from_element(5, 5, 3),
                    )
                    .with_weight(WeightKind::SegAwareNearest, Image::from_element(5, 5, 7.0)),
                ),
            })
            .collect();
        cutouts.push_object(
            ObjectInfo {
                id: 555,
                number: 3,
                ncutout: 0,
                box_size: 5,
            },
            epochs,
        );
        cutouts
    }

    #[test]
    fn test_build_object() {
        let sources: Vec<Arc<dyn CutoutSource>> = vec![Arc::new(source())];
        let psf = GaussianPsf::new(vec![1.2], 11);
        let images = sources[0].image_info().to_vec();
        let flags = BandImageFlags::reduce(&[images.as_slice()], 8, None, &psf).unwrap();
        let params = AssemblyParams::builder()
            .weight_policy(WeightPolicy::Mof)
            .min_weight(0.1)
            .build()
            .unwrap();

        let builder = ObservationBuilder::new(&sources, &psf, &flags, &params);
        let (coadd, epochs) = builder.build(0).unwrap();

        assert_eq!(coadd.bands[0].len(), 1);
        assert_eq!(epochs.bands[0].len(), 2);
        assert_eq!(coadd.meta.nimage_tot, vec![2]);
        assert_eq!(epochs.id, 555);

        let ref_obs = &coadd.bands[0][0];
        assert!(ref_obs.is_good());
        assert_eq!(ref_obs.weight[(0, 0)], 0.0);
        assert_eq!(ref_obs.weight[(0, 1)], 0.0);
        assert_eq!(ref_obs.weight[(2, 2)], 2.0);
        assert_eq!(ref_obs.weight_us.as_ref().unwrap()[(0, 0)], 7.0);
        assert_eq!(ref_obs.filename, "coadd.fits");
        assert_relative_eq!(ref_obs.meta.pixel_scale, 0.263, epsilon = 1e-12);
        let psf_obs = ref_obs.psf.as_ref().unwrap();
        assert_eq!(psf_obs.jacobian.center(), (5.0, 5.0));

        // raw flag 8 is checked: second single epoch is flagged but keeps its meta-data
        let flagged = &epochs.bands[0][1];
        assert_eq!(flagged.flags, IMAGE_FLAGS);
        assert_eq!(flagged.shape(), (0, 0));
        assert!(flagged.has_epoch_info);
        assert_eq!(flagged.file_id, 2);
        assert_eq!(flagged.meta.cutout_index, 2);
        assert_eq!(flagged.meta.image_id, 3);
        assert_eq!(flagged.orig_row, 102.0);
    }

    #[test]
    fn test_missing_pixels_degrade_to_flagged() {
        let mut cutouts = source();
        cutouts.object_mut(0).unwrap().epochs[1].pixels = None;
        let sources: Vec<Arc<dyn CutoutSource>> = vec![Arc::new(cutouts)];
        let mut psf = GaussianPsf::new(vec![1.2], 11);
        psf.mark_missing(0, 0, 0);
        let images = sources[0].image_info().to_vec();
        let flags = BandImageFlags::reduce(&[images.as_slice()], 0, None, &psf).unwrap();
        let params = AssemblyParams::default();

        let builder = ObservationBuilder::new(&sources, &psf, &flags, &params);
        let (coadd, epochs) = builder.build(0).unwrap();
        assert_eq!(coadd.bands[0][0].flags, IMAGE_FLAGS);
        assert_eq!(epochs.bands[0][0].flags, IMAGE_FLAGS);
        assert!(epochs.bands[0][1].is_good());
        assert_eq!(flags.band(0), &[0, 0, 0]);
    }
}
