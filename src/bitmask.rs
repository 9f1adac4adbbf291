//! # Bitmask propagation
//!
//! Saturated stars bleed into pixels that are not marked in every epoch. This module spreads
//! a defect mask geometrically across the epochs and bands of one object and zeroes the
//! weights of background pixels it covers.
//!
//! ## Algorithm
//!
//! 1. [`select_bits`] reduces each good observation's bitmask to 0/1 with a
//!    [`MaskBitSelection`],
//! 2. for every band `t`, the selected masks of every good observation (reference and single
//!    epochs, all bands) are resampled into band `t`'s reference frame and OR'ed
//!    ([`combined_masks`]),
//! 3. band `b`'s combined mask is resampled into the frame of each of its good observations,
//!    dilated by `mask_dilation_rounds`, and weights are zeroed where the result is set and
//!    the segmentation map is background ([`propagate_masks`]).
//!
//! Resampling ([`resample_nearest`]) copies the nearest source pixel: masks are labels, not
//! intensities.
//!
//! The module also hosts the stellar-halo contamination check ([`stellar_halo_flags`]).
use tracing::{debug, warn};

use crate::{
    constants::{IntImage, OBJ_FLAG_STELLAR_HALO},
    jacobian::Jacobian,
    mofprep_errors::MofError,
    observations::MultiBandObsList,
    params::{AssemblyParams, MaskBitSelection},
};

/// 1 where the mask value matches `selection`, 0 elsewhere.
pub fn select_bits(mask: &IntImage, selection: &MaskBitSelection) -> IntImage {
    mask.map(|v| selection.matches(v) as i32)
}

/// Nearest-pixel remapping of `src` (in the frame of `src_jac`) into the frame of `tgt_jac`.
///
/// For every target pixel `(r, c)`:
///
/// ```text
/// (u, v)   = J_tgt · (r − r0_tgt, c − c0_tgt)
/// (r1, c1) = round(J_src⁻¹ · (u, v) + (r0_src, c0_src))
/// ```
///
/// and the source value is copied when `(r1, c1)` is inside `src`, 0 otherwise.
///
/// Return
/// ------
/// * the resampled grid of shape `tgt_shape`, or [`MofError::InvariantViolation`] when the
///   source and target cutouts differ in size.
pub fn resample_nearest(
    src: &IntImage,
    src_jac: &Jacobian,
    tgt_jac: &Jacobian,
    tgt_shape: (usize, usize),
) -> Result<IntImage, MofError> {
    if src.shape() != tgt_shape {
        return Err(MofError::InvariantViolation(format!(
            "cannot resample a {:?} mask into a {:?} cutout",
            src.shape(),
            tgt_shape
        )));
    }
    let (nrows, ncols) = src.shape();
    Ok(IntImage::from_fn(tgt_shape.0, tgt_shape.1, |r, c| {
        let (u, v) = tgt_jac.pixel_to_uv(r as f64, c as f64);
        let (r1, c1) = src_jac.uv_to_pixel(u, v);
        let (r1, c1) = (r1.round(), c1.round());
        if r1 >= 0.0 && c1 >= 0.0 && (r1 as usize) < nrows && (c1 as usize) < ncols {
            src[(r1 as usize, c1 as usize)]
        } else {
            0
        }
    }))
}

/// Morphological dilation with 8-connectivity.
///
/// Each round sets every pixel adjacent (diagonals included) to a set pixel, so `rounds`
/// rounds amount to a square structuring element of half-width `rounds`; it is applied as a
/// horizontal then a vertical pass. The output is 0/1.
pub fn dilate(mask: &IntImage, rounds: usize) -> IntImage {
    let (nrows, ncols) = mask.shape();
    let set = mask.map(|v| (v != 0) as i32);
    if rounds == 0 || nrows == 0 || ncols == 0 {
        return set;
    }

    let horizontal = IntImage::from_fn(nrows, ncols, |r, c| {
        let lo = c.saturating_sub(rounds);
        let hi = (c + rounds).min(ncols - 1);
        (lo..=hi).any(|cc| set[(r, cc)] != 0) as i32
    });
    IntImage::from_fn(nrows, ncols, |r, c| {
        let lo = r.saturating_sub(rounds);
        let hi = (r + rounds).min(nrows - 1);
        (lo..=hi).any(|rr| horizontal[(rr, c)] != 0) as i32
    })
}

/// Reference frame (Jacobian and shape) of every band, `None` when the band's reference
/// observation is missing or flagged.
fn reference_frames(coadd: &MultiBandObsList) -> Vec<Option<(Jacobian, (usize, usize))>> {
    coadd
        .bands
        .iter()
        .map(|list| {
            list.first()
                .filter(|obs| obs.is_good())
                .map(|obs| (obs.jacobian.clone(), obs.shape()))
        })
        .collect()
}

/// Combined selected mask of every band, in that band's reference frame.
///
/// Bands without a usable reference observation get `None`.
pub fn combined_masks(
    coadd: &MultiBandObsList,
    epochs: &MultiBandObsList,
    selection: &MaskBitSelection,
) -> Result<Vec<Option<IntImage>>, MofError> {
    let frames = reference_frames(coadd);
    let contributions: Vec<(IntImage, &Jacobian)> = coadd
        .good_obs()
        .chain(epochs.good_obs())
        .filter_map(|(_, obs)| {
            obs.bmask
                .as_ref()
                .map(|bmask| (select_bits(bmask, selection), &obs.jacobian))
        })
        .collect();

    frames
        .iter()
        .map(|frame| {
            let Some((tgt_jac, shape)) = frame else {
                return Ok(None);
            };
            let mut combined = IntImage::zeros(shape.0, shape.1);
            for (selected, src_jac) in &contributions {
                let resampled = resample_nearest(selected, src_jac, tgt_jac, *shape)?;
                combined.zip_apply(&resampled, |a, b| *a |= b);
            }
            Ok(Some(combined))
        })
        .collect()
}

/// Spread the selected defect mask to every good observation of both views.
///
/// Return
/// ------
/// * the number of weight pixels zeroed
pub fn propagate_masks(
    coadd: &mut MultiBandObsList,
    epochs: &mut MultiBandObsList,
    params: &AssemblyParams,
) -> Result<usize, MofError> {
    let combined = combined_masks(coadd, epochs, &params.sat_mask_bits)?;
    let frames = reference_frames(coadd);

    let mut nmasked = 0;
    for view in [&mut *coadd, &mut *epochs] {
        for (band, list) in view.bands.iter_mut().enumerate() {
            let (Some(Some(mask)), Some(Some((ref_jac, _)))) = (combined.get(band), frames.get(band))
            else {
                if list.iter().any(|obs| obs.is_good()) {
                    warn!("band {band}: no usable reference cutout, mask not propagated");
                }
                continue;
            };
            for obs in list.iter_mut().filter(|obs| obs.is_good()) {
                let local = resample_nearest(mask, ref_jac, &obs.jacobian, obs.shape())?;
                let dilated = dilate(&local, params.mask_dilation_rounds);
                let kill = dilated.zip_map(&obs.seg, |m, seg| m != 0 && seg == 0);
                let n = obs.zero_weights_where(|r, c| kill[(r, c)]);
                if n > 0 {
                    debug!(
                        "masked {n} pixels due to saturation in any band (band {band}, cutout {})",
                        obs.icut
                    );
                }
                nmasked += n;
            }
        }
    }
    Ok(nmasked)
}

/// Contamination flag of one view: [`OBJ_FLAG_STELLAR_HALO`] when a good observation has
/// `halo_bit` set on a pixel of the object's own segmentation footprint, 0 otherwise.
pub fn stellar_halo_flags(view: &MultiBandObsList, halo_bit: i32) -> i64 {
    let touched = view.good_obs().any(|(_, obs)| {
        obs.bmask.as_ref().is_some_and(|bmask| {
            bmask
                .iter()
                .zip(obs.seg.iter())
                .any(|(&m, &seg)| (m & halo_bit) != 0 && seg as i64 == view.number)
        })
    });
    if touched {
        OBJ_FLAG_STELLAR_HALO
    } else {
        0
    }
}

/// Mask propagation and stellar-halo flagging of one object, as enabled by `params`.
///
/// The halo check looks at the reference view first and only falls back to the single
/// epochs when the reference view found nothing. The flag is OR'ed into both views.
pub fn apply_mask_policies(
    coadd: &mut MultiBandObsList,
    epochs: &mut MultiBandObsList,
    params: &AssemblyParams,
) -> Result<(), MofError> {
    if params.propagate_sat_starpix {
        propagate_masks(coadd, epochs, params)?;
    }

    if params.flag_stellar_halo {
        let mut flags = stellar_halo_flags(coadd, params.stellar_halo_bit);
        if flags == 0 {
            flags = stellar_halo_flags(epochs, params.stellar_halo_bit);
        }
        if flags != 0 {
            debug!(
                "flagged object {} due to seg map touching masked stellar halo",
                coadd.id
            );
            coadd.obj_flags |= flags;
            epochs.obj_flags |= flags;
        }
    }
    Ok(())
}

#[cfg(test)]
mod bitmask_test {
    use super::*;
    use crate::{
        constants::{Image, IMAGE_FLAGS},
        observations::Observation,
    };

    fn mask_with(n: usize, set: &[(usize, usize)], value: i32) -> IntImage {
        let mut m = IntImage::zeros(n, n);
        for &(r, c) in set {
            m[(r, c)] = value;
        }
        m
    }

    fn good_obs(n: usize, icut: usize, bmask: IntImage, jac: Jacobian) -> Observation {
        let mut obs = Observation::flagged(icut, 0);
        obs.image = Image::from_element(n, n, 1.0);
        obs.weight = Image::from_element(n, n, 1.0);
        obs.weight_raw = obs.weight.clone();
        obs.seg = IntImage::zeros(n, n);
        obs.bmask = Some(bmask);
        obs.jacobian = jac;
        obs
    }

    fn jac(row0: f64, col0: f64) -> Jacobian {
        Jacobian::new(row0, col0, 0.0, 0.263, 0.263, 0.0).unwrap()
    }

    #[test]
    fn test_select_bits() {
        let mut mask = IntImage::zeros(1, 5);
        mask[(0, 0)] = 2 | 32;
        mask[(0, 1)] = 4 | 32 | 64;
        mask[(0, 2)] = 2;
        mask[(0, 3)] = 2 | 32 | 8;
        mask[(0, 4)] = 32;
        let sel = select_bits(&mask, &MaskBitSelection::default());
        assert_eq!(sel.as_slice(), &[1, 1, 0, 0, 0]);
    }

    #[test]
    fn test_resample_identity() {
        let j = jac(4.0, 4.0);
        let mask = mask_with(9, &[(0, 0), (3, 7), (8, 8)], 1);
        let out = resample_nearest(&mask, &j, &j, (9, 9)).unwrap();
        assert_eq!(out, mask);
        let back = resample_nearest(&out, &j, &j, (9, 9)).unwrap();
        assert_eq!(back, mask);
    }

    #[test]
    fn test_resample_shift() {
        // same linear part, target center one pixel further along rows
        let src_jac = jac(4.0, 4.0);
        let tgt_jac = jac(5.0, 4.0);
        let mask = mask_with(9, &[(2, 3)], 1);
        let out = resample_nearest(&mask, &src_jac, &tgt_jac, (9, 9)).unwrap();
        assert_eq!(out[(3, 3)], 1);
        assert_eq!(out.iter().sum::<i32>(), 1);
        // out-of-bounds target pixels read 0
        assert_eq!(out[(0, 0)], 0);
    }

    #[test]
    fn test_resample_size_mismatch() {
        let j = jac(4.0, 4.0);
        let err = resample_nearest(&IntImage::zeros(9, 9), &j, &j, (8, 8));
        assert!(matches!(err, Err(MofError::InvariantViolation(_))));
    }

    #[test]
    fn test_dilation_rounds() {
        let mask = mask_with(9, &[(4, 4)], 7);
        let one = dilate(&mask, 1);
        assert_eq!(one.iter().sum::<i32>(), 9);
        assert_eq!(one[(3, 3)], 1);
        let two = dilate(&mask, 2);
        assert_eq!(two.iter().sum::<i32>(), 25);
        assert_eq!(dilate(&mask, 0), mask_with(9, &[(4, 4)], 1));

        // corner pixel, clipped at the border
        let corner = dilate(&mask_with(5, &[(0, 0)], 1), 1);
        assert_eq!(corner.iter().sum::<i32>(), 4);
    }

    #[test]
    fn test_dilation_is_monotone() {
        let mask = mask_with(12, &[(1, 2), (7, 9), (11, 0)], 1);
        let mut prev = dilate(&mask, 0);
        for rounds in 1..6 {
            let next = dilate(&mask, rounds);
            assert!(prev.iter().zip(next.iter()).all(|(&p, &n)| p <= n));
            prev = next;
        }
    }

    #[test]
    fn test_propagation_spares_own_footprint() {
        let n = 9;
        let sat = 2 | 32;
        let mut coadd = MultiBandObsList::new(1, 5, 0, 2);
        let mut epochs = MultiBandObsList::new(1, 5, 0, 2);

        let mut ref0 = good_obs(n, 0, mask_with(n, &[(4, 4)], sat), jac(4.0, 4.0));
        ref0.seg[(4, 4)] = 5;
        ref0.seg[(4, 5)] = 5;
        let ref1 = good_obs(n, 0, IntImage::zeros(n, n), jac(4.0, 4.0));
        let mut se0 = good_obs(n, 1, IntImage::zeros(n, n), jac(4.0, 4.0));
        se0.seg[(4, 4)] = 5;
        let se1 = good_obs(n, 1, IntImage::zeros(n, n), jac(3.0, 4.0));

        coadd.bands = vec![vec![ref0], vec![ref1]];
        epochs.bands = vec![
            vec![se0, Observation::flagged(2, IMAGE_FLAGS)],
            vec![se1],
        ];

        let params = AssemblyParams::builder()
            .propagate_sat_starpix(true)
            .mask_dilation_rounds(1)
            .build()
            .unwrap();
        apply_mask_policies(&mut coadd, &mut epochs, &params).unwrap();

        let ref0 = &coadd.bands[0][0];
        assert_eq!(ref0.weight[(4, 4)], 1.0);
        assert_eq!(ref0.weight[(4, 5)], 1.0);
        assert_eq!(ref0.weight[(3, 3)], 0.0);
        assert_eq!(ref0.weight[(5, 5)], 0.0);
        assert_eq!(ref0.weight[(2, 2)], 1.0);

        let ref1 = &coadd.bands[1][0];
        assert_eq!(ref1.weight[(4, 4)], 0.0);
        assert_eq!(ref1.weight_raw[(3, 5)], 0.0);

        let se0 = &epochs.bands[0][0];
        assert_eq!(se0.weight[(4, 4)], 1.0);
        assert_eq!(se0.weight[(4, 3)], 0.0);

        // se1 is centered one row lower in its cutout: the defect lands on row 3
        let se1 = &epochs.bands[1][0];
        assert_eq!(se1.weight[(3, 4)], 0.0);
        assert_eq!(se1.weight[(2, 4)], 0.0);
        assert_eq!(se1.weight[(5, 4)], 1.0);

        assert_eq!(epochs.bands[0][1].shape(), (0, 0));
    }

    #[test]
    fn test_stellar_halo_short_circuit() {
        let n = 5;
        let mut coadd = MultiBandObsList::new(1, 3, 0, 1);
        let mut epochs = MultiBandObsList::new(1, 3, 0, 1);

        let mut ref0 = good_obs(n, 0, mask_with(n, &[(0, 0)], 32), jac(2.0, 2.0));
        ref0.seg[(1, 1)] = 3;
        let mut se = good_obs(n, 1, mask_with(n, &[(1, 1)], 32), jac(2.0, 2.0));
        se.seg[(1, 1)] = 3;
        coadd.bands = vec![vec![ref0]];
        epochs.bands = vec![vec![se]];

        // halo does not touch the footprint in the reference, but does in the epoch
        assert_eq!(stellar_halo_flags(&coadd, 32), 0);
        assert_eq!(stellar_halo_flags(&epochs, 32), OBJ_FLAG_STELLAR_HALO);

        let params = AssemblyParams::builder()
            .flag_stellar_halo(true)
            .build()
            .unwrap();
        apply_mask_policies(&mut coadd, &mut epochs, &params).unwrap();
        assert_eq!(coadd.obj_flags, OBJ_FLAG_STELLAR_HALO);
        assert_eq!(epochs.obj_flags, OBJ_FLAG_STELLAR_HALO);
    }
}
