//! # Neighbor geometry
//!
//! Objects of a group are fit jointly: every good observation of a central object carries the
//! PSF and local frame of each of its neighbors, as they appear in that same cutout.
//!
//! For a central observation and a neighbor, in the same band:
//!
//! 1. **Shared image.** When the neighbor has a cutout from the same image (the last match
//!    wins), a good one gives the neighbor's own PSF and a Jacobian with the neighbor's linear
//!    part, centered at the neighbor's mosaic position relative to the central cutout origin.
//!    A flagged one makes the pair unavailable.
//! 2. **No data.** A neighbor without any cutout in the band is unavailable.
//! 3. **Off-chip.** Otherwise both objects are placed on the sky through the reference-image
//!    WCS ([`SkyMap`]); the neighbor's tangent-plane offset `(u, v)` from the central object
//!    goes through the central Jacobian's inverse to a pixel position, where a copy of the
//!    central Jacobian is re-centered. The central object's own PSF stands in for the
//!    neighbor's.
//!
//! A neighbor is flagged (1) when its PSF or Jacobian is unavailable or when its own
//! `obj_flags` are non-zero.
use tracing::{debug, warn};

use crate::{
    constants::{FileId, NBR_FLAGGED, NBR_OK},
    cutouts::SkyMap,
    jacobian::Jacobian,
    mofprep_errors::MofError,
    observations::{MultiBandObsList, NeighborGeometry, Observation, PsfObservation},
    sphere::{radec_to_basis, tangent_offset},
    tables::NeighborTable,
};

/// Position of an object in the reference image of a band.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ReferencePosition {
    file_id: FileId,
    row: f64,
    col: f64,
}

type NbrPair = (Option<PsfObservation>, Option<Jacobian>);

pub struct NeighborEngine<'a> {
    sky: Option<&'a dyn SkyMap>,
    table: Option<&'a NeighborTable>,
}

impl<'a> NeighborEngine<'a> {
    /// Arguments
    /// ---------
    /// * `sky`: reference-image WCS for off-chip neighbors; without it they are unavailable
    /// * `table`: optional neighbor pairs; without it every other group member is a neighbor
    pub fn new(sky: Option<&'a dyn SkyMap>, table: Option<&'a NeighborTable>) -> Self {
        NeighborEngine { sky, table }
    }

    /// Neighbors of every member of a group, as positions in the group.
    pub fn neighbor_lists(&self, members: &[MultiBandObsList]) -> Result<Vec<Vec<usize>>, MofError> {
        if members.len() < 2 {
            return Ok(vec![Vec::new(); members.len()]);
        }

        members
            .iter()
            .enumerate()
            .map(|(cen, member)| {
                let inds: Vec<usize> = match self.table {
                    Some(table) => table
                        .neighbors_of(member.number)
                        .iter()
                        .map(|&nbr_number| {
                            let matches: Vec<usize> = members
                                .iter()
                                .enumerate()
                                .filter(|(_, m)| m.number == nbr_number)
                                .map(|(i, _)| i)
                                .collect();
                            match matches.as_slice() {
                                [ind] => Ok(*ind),
                                _ => Err(MofError::InvariantViolation(format!(
                                    "neighbor number {nbr_number} of object {} matches {} group members",
                                    member.number,
                                    matches.len()
                                ))),
                            }
                        })
                        .collect::<Result<_, _>>()?,
                    None => (0..members.len()).filter(|&i| i != cen).collect(),
                };
                if inds.contains(&cen) {
                    return Err(MofError::InvariantViolation(format!(
                        "object {} is listed as its own neighbor",
                        member.number
                    )));
                }
                Ok(inds)
            })
            .collect()
    }

    /// Attach neighbor lists and geometry to both views of every member of a group.
    ///
    /// `coadd[i]` and `epochs[i]` are the two views of the `i`-th member. Image and weight
    /// snapshots (`image_orig`, `weight_orig`) are taken first.
    pub fn attach(
        &self,
        coadd: &mut [MultiBandObsList],
        epochs: &mut [MultiBandObsList],
    ) -> Result<(), MofError> {
        if coadd.len() != epochs.len() {
            return Err(MofError::InvariantViolation(format!(
                "{} reference views for {} single-epoch views",
                coadd.len(),
                epochs.len()
            )));
        }

        for mb in coadd.iter_mut().chain(epochs.iter_mut()) {
            mb.iter_obs_mut().for_each(Observation::snapshot);
        }

        let lists = self.neighbor_lists(coadd)?;
        for (cen, inds) in lists.iter().enumerate() {
            let ids: Vec<_> = inds.iter().map(|&i| coadd[i].id).collect();
            for mb in [&mut coadd[cen], &mut epochs[cen]] {
                mb.cen_ind = Some(cen);
                mb.nbrs_inds = inds.clone();
                mb.nbrs_ids = ids.clone();
            }
        }

        let refs: Vec<Vec<Option<ReferencePosition>>> = coadd
            .iter()
            .map(|mb| {
                mb.bands
                    .iter()
                    .map(|list| {
                        list.first()
                            .filter(|obs| obs.has_epoch_info)
                            .map(|obs| ReferencePosition {
                                file_id: obs.file_id,
                                row: obs.orig_row,
                                col: obs.orig_col,
                            })
                    })
                    .collect()
            })
            .collect();

        self.attach_view(coadd, &refs)?;
        self.attach_view(epochs, &refs)?;
        Ok(())
    }

    fn attach_view(
        &self,
        view: &mut [MultiBandObsList],
        refs: &[Vec<Option<ReferencePosition>>],
    ) -> Result<(), MofError> {
        // geometry is computed from the untouched view, then stored
        let mut geometry: Vec<Vec<Vec<NeighborGeometry>>> = Vec::with_capacity(view.len());
        for (cen, cen_mb) in view.iter().enumerate() {
            let mut per_band = Vec::with_capacity(cen_mb.nband());
            for (band, list) in cen_mb.bands.iter().enumerate() {
                let mut per_obs = Vec::with_capacity(list.len());
                for cen_obs in list {
                    let mut geom = NeighborGeometry::default();
                    if cen_obs.is_good() {
                        for &ind in &cen_mb.nbrs_inds {
                            if ind == cen {
                                return Err(MofError::InvariantViolation(format!(
                                    "cen_ind {cen} is in its own nbrs_inds"
                                )));
                            }
                            let nbr_mb = &view[ind];
                            let (psf, jac) = self.neighbor_psf_and_jacobian(
                                band,
                                (cen, cen_obs),
                                (ind, nbr_mb),
                                refs,
                            )?;
                            let flag = if psf.is_none() || jac.is_none() || nbr_mb.obj_flags != 0 {
                                NBR_FLAGGED
                            } else {
                                NBR_OK
                            };
                            geom.push(psf, jac, flag);
                        }
                    }
                    per_obs.push(geom);
                }
                per_band.push(per_obs);
            }
            geometry.push(per_band);
        }

        for (mb, per_band) in view.iter_mut().zip(geometry) {
            for (list, per_obs) in mb.bands.iter_mut().zip(per_band) {
                for (obs, geom) in list.iter_mut().zip(per_obs) {
                    obs.nbrs = Some(geom);
                }
            }
        }
        Ok(())
    }

    fn neighbor_psf_and_jacobian(
        &self,
        band: usize,
        (cen, cen_obs): (usize, &Observation),
        (ind, nbr_mb): (usize, &MultiBandObsList),
        refs: &[Vec<Option<ReferencePosition>>],
    ) -> Result<NbrPair, MofError> {
        let nbr_list = nbr_mb.bands.get(band).map(Vec::as_slice).unwrap_or(&[]);

        if let Some(nbr_obs) = nbr_list
            .iter()
            .rev()
            .find(|obs| obs.has_epoch_info && obs.file_id == cen_obs.file_id)
        {
            if !nbr_obs.is_good() {
                return Ok((None, None));
            }
            let jac = Jacobian::from_matrix(
                nbr_obs.orig_row - cen_obs.orig_start_row,
                nbr_obs.orig_col - cen_obs.orig_start_col,
                *nbr_obs.jacobian.linear(),
            )?;
            return Ok((nbr_obs.psf.clone(), Some(jac)));
        }

        let cen_ref = refs.get(cen).and_then(|r| r.get(band).copied().flatten());
        let nbr_ref = refs.get(ind).and_then(|r| r.get(band).copied().flatten());
        let (Some(cen_ref), Some(nbr_ref)) = (cen_ref, nbr_ref) else {
            // no cutout at all in this band
            return Ok((None, None));
        };
        self.offchip_psf_and_jacobian(band, (cen, cen_obs, cen_ref), (ind, nbr_ref))
    }

    fn offchip_psf_and_jacobian(
        &self,
        band: usize,
        (cen, cen_obs, cen_ref): (usize, &Observation, ReferencePosition),
        (ind, nbr_ref): (usize, ReferencePosition),
    ) -> Result<NbrPair, MofError> {
        if cen_ref.file_id != nbr_ref.file_id {
            return Err(MofError::InvariantViolation(format!(
                "central and nbr have different coadd file IDs when getting off-chip WCS! cen file_id = {}, nbr file_id = {}",
                cen_ref.file_id, nbr_ref.file_id
            )));
        }
        let Some(sky) = self.sky else {
            warn!("no WCS available, off-chip nbr {} for cen {} is unavailable", ind + 1, cen + 1);
            return Ok((None, None));
        };

        let cen_sky = sky.image_to_sky(band, cen_ref.file_id, cen_ref.row, cen_ref.col);
        let nbr_sky = sky.image_to_sky(band, nbr_ref.file_id, nbr_ref.row, nbr_ref.col);
        let (Some((ra_cen, dec_cen)), Some((ra_nbr, dec_nbr))) = (cen_sky, nbr_sky) else {
            warn!(
                "band {band}: no WCS for reference image {}, off-chip nbr {} for cen {} is unavailable",
                cen_ref.file_id,
                ind + 1,
                cen + 1
            );
            return Ok((None, None));
        };

        let Some((u, v)) = tangent_offset(
            &radec_to_basis(ra_cen, dec_cen),
            &radec_to_basis(ra_nbr, dec_nbr),
        ) else {
            return Ok((None, None));
        };

        let (row, col) = cen_obs.jacobian.uv_to_pixel(u, v);
        let jac = cen_obs.jacobian.with_center(row, col);

        debug!(
            "did off-chip nbr {} for cen {}: band {band}, cen icut {}, (u, v) = ({u:.3}, {v:.3}), (row, col) = ({row:.2}, {col:.2})",
            ind + 1,
            cen + 1,
            cen_obs.icut
        );
        Ok((cen_obs.psf.clone(), Some(jac)))
    }
}
