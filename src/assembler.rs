//! # Group assembler
//!
//! [`GroupAssembler`] is the processing-unit context. It owns the injected collaborators
//! ([`SurveyInputs`]) and the validated [`AssemblyParams`], reduces the image flags once, builds
//! the [`GroupIndex`], then assembles groups on request.
//!
//! ## Per group
//!
//! 1. build the reference and single-epoch views of every member, in row order
//!    ([`ObservationBuilder`]);
//! 2. bitmask propagation and stellar-halo flag ([`apply_mask_policies`]);
//! 3. stamp the FoF id on the object meta;
//! 4. OR the external object flags;
//! 5. when `model_nbrs`, attach neighbor lists and geometry ([`NeighborEngine`]).
//!
//! ## Typical usage
//!
//! ```rust, no_run
//! use std::sync::Arc;
//! use mofprep::assembler::{GroupAssembler, SurveyInputs};
//! use mofprep::cutouts::{memory::{GaussianPsf, MemoryCutouts}, CutoutSource};
//! use mofprep::params::AssemblyParams;
//!
//! let band: Arc<dyn CutoutSource> = Arc::new(MemoryCutouts::new(vec![]));
//! let inputs = SurveyInputs::new(vec![band], Arc::new(GaussianPsf::new(vec![1.2], 25)));
//! let assembler = GroupAssembler::new(inputs, AssemblyParams::default()).unwrap();
//!
//! for group in assembler.iter() {
//!     let group = group.unwrap();
//!     println!("fofid {}: {} members", group.fofid, group.rows.len());
//! }
//! ```
//!
//! Collaborators are `Arc`-shared `Send + Sync` trait objects and the assembler is read-only
//! once built, so distinct groups may be assembled from different threads.
use std::sync::Arc;

use tracing::{debug, info};

use crate::{
    bitmask::apply_mask_policies,
    builder::ObservationBuilder,
    constants::{GroupId, ObjectNumber, RowIndex},
    cutouts::{CutoutSource, ImageInfo, PsfProvider, SkyMap},
    groups::GroupIndex,
    image_flags::{BandImageFlags, FlagOverride},
    mofprep_errors::MofError,
    neighbors::NeighborEngine,
    observations::MultiBandObsList,
    params::AssemblyParams,
    tables::{GroupTable, NeighborTable, ObjectFlagTable},
};

/// Collaborators and auxiliary tables of one processing unit.
#[derive(Clone)]
pub struct SurveyInputs {
    /// One cutout source per band
    pub sources: Vec<Arc<dyn CutoutSource>>,
    pub psf: Arc<dyn PsfProvider>,
    /// Reference-image WCS, needed for off-chip neighbors
    pub sky: Option<Arc<dyn SkyMap>>,
    pub groups: Option<GroupTable>,
    pub neighbors: Option<NeighborTable>,
    pub obj_flags: Option<ObjectFlagTable>,
    pub flag_override: Option<FlagOverride>,
}

impl SurveyInputs {
    pub fn new(sources: Vec<Arc<dyn CutoutSource>>, psf: Arc<dyn PsfProvider>) -> Self {
        SurveyInputs {
            sources,
            psf,
            sky: None,
            groups: None,
            neighbors: None,
            obj_flags: None,
            flag_override: None,
        }
    }

    pub fn with_sky(mut self, sky: Arc<dyn SkyMap>) -> Self {
        self.sky = Some(sky);
        self
    }

    pub fn with_groups(mut self, groups: GroupTable) -> Self {
        self.groups = Some(groups);
        self
    }

    pub fn with_neighbors(mut self, neighbors: NeighborTable) -> Self {
        self.neighbors = Some(neighbors);
        self
    }

    pub fn with_obj_flags(mut self, obj_flags: ObjectFlagTable) -> Self {
        self.obj_flags = Some(obj_flags);
        self
    }

    pub fn with_flag_override(mut self, flag_override: FlagOverride) -> Self {
        self.flag_override = Some(flag_override);
        self
    }
}

/// The two views of every member of one group, in row order.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupObservations {
    pub fofid: GroupId,
    pub rows: Vec<RowIndex>,
    /// Reference-epoch view, one entry per member
    pub coadd: Vec<MultiBandObsList>,
    /// Single-epoch view, one entry per member
    pub epochs: Vec<MultiBandObsList>,
}

impl GroupObservations {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

pub struct GroupAssembler {
    inputs: SurveyInputs,
    params: AssemblyParams,
    image_flags: BandImageFlags,
    index: GroupIndex,
}

impl GroupAssembler {
    /// Validate the inputs and prepare the processing unit.
    ///
    /// Arguments
    /// ---------
    /// * `inputs`: per-band cutout sources, PSF provider, optional WCS and tables
    /// * `params`: assembly parameters
    ///
    /// Return
    /// ------
    /// * The assembler, or a configuration error ([`MofError::NoBands`], catalog
    ///   mismatches from [`GroupIndex::new`], replacement-flag parsing errors).
    pub fn new(inputs: SurveyInputs, params: AssemblyParams) -> Result<Self, MofError> {
        if inputs.sources.is_empty() {
            return Err(MofError::NoBands);
        }
        info!("{}", params);

        let image_tables: Vec<&[ImageInfo]> =
            inputs.sources.iter().map(|s| s.image_info()).collect();
        let image_flags = BandImageFlags::reduce(
            &image_tables,
            params.image_flags_to_check,
            inputs.flag_override.as_ref(),
            inputs.psf.as_ref(),
        )?;

        let band_numbers: Vec<Vec<ObjectNumber>> =
            inputs.sources.iter().map(|s| s.numbers()).collect();
        let index = GroupIndex::new(
            &band_numbers,
            inputs.groups.as_ref(),
            params.group_range.clone(),
        )?;

        Ok(GroupAssembler {
            inputs,
            params,
            image_flags,
            index,
        })
    }

    /// Sorted group ids of the processing unit.
    pub fn groups(&self) -> &[GroupId] {
        self.index.group_ids()
    }

    pub fn nband(&self) -> usize {
        self.inputs.sources.len()
    }

    pub fn params(&self) -> &AssemblyParams {
        &self.params
    }

    pub fn image_flags(&self) -> &BandImageFlags {
        &self.image_flags
    }

    pub fn index(&self) -> &GroupIndex {
        &self.index
    }

    /// Assemble every member of a group.
    ///
    /// Arguments
    /// ---------
    /// * `fofid`: group id; any group of the index, not only those of the processing unit
    ///
    /// Return
    /// ------
    /// * The group's two views, or [`MofError::UnknownGroup`] and invariant violations.
    ///   Per-epoch data problems never fail a group: they show up as flagged observations.
    pub fn assemble(&self, fofid: GroupId) -> Result<GroupObservations, MofError> {
        let rows = self.index.rows(fofid)?.to_vec();
        let builder = ObservationBuilder::new(
            &self.inputs.sources,
            self.inputs.psf.as_ref(),
            &self.image_flags,
            &self.params,
        );

        let mut coadd = Vec::with_capacity(rows.len());
        let mut epochs = Vec::with_capacity(rows.len());
        for &row in &rows {
            let (mut cen_coadd, mut cen_epochs) = builder.build(row)?;
            apply_mask_policies(&mut cen_coadd, &mut cen_epochs, &self.params)?;

            for mb in [&mut cen_coadd, &mut cen_epochs] {
                mb.set_fofid(fofid);
                if let Some(flags) = self
                    .inputs
                    .obj_flags
                    .as_ref()
                    .and_then(|table| table.flags_for(mb.id))
                {
                    mb.obj_flags |= flags;
                }
            }

            coadd.push(cen_coadd);
            epochs.push(cen_epochs);
        }

        if self.params.model_nbrs {
            let engine = NeighborEngine::new(
                self.inputs.sky.as_deref(),
                self.inputs.neighbors.as_ref(),
            );
            engine.attach(&mut coadd, &mut epochs)?;
        }

        debug!(
            "assembled fofid {fofid}: {} members, {} flagged",
            rows.len(),
            coadd.iter().filter(|mb| mb.obj_flags != 0).count()
        );

        Ok(GroupObservations {
            fofid,
            rows,
            coadd,
            epochs,
        })
    }

    /// Pull-based iteration over the groups of the processing unit, in order.
    pub fn iter(&self) -> GroupIter<'_> {
        GroupIter {
            assembler: self,
            next: 0,
        }
    }
}

impl<'a> IntoIterator for &'a GroupAssembler {
    type Item = Result<GroupObservations, MofError>;
    type IntoIter = GroupIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct GroupIter<'a> {
    assembler: &'a GroupAssembler,
    next: usize,
}

impl Iterator for GroupIter<'_> {
    type Item = Result<GroupObservations, MofError>;

    fn next(&mut self) -> Option<Self::Item> {
        let fofid = *self.assembler.groups().get(self.next)?;
        self.next += 1;
        Some(self.assembler.assemble(fofid))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.assembler.groups().len().saturating_sub(self.next);
        (left, Some(left))
    }
}

impl ExactSizeIterator for GroupIter<'_> {}

#[cfg(test)]
mod assembler_test {
    use super::*;
    use crate::{
        constants::{Image, IntImage, BAD_OBJ},
        cutouts::{
            memory::{EpochPixels, GaussianPsf, MemoryCutouts, MemoryEpoch},
            EpochInfo, ObjectInfo,
        },
        jacobian::Jacobian,
        tables::{GroupRecord, ObjectFlagRecord},
    };

    fn source() -> MemoryCutouts {
        let images = ["coadd.fits", "se_1.fits"]
            .iter()
            .enumerate()
            .map(|(i, p)| ImageInfo {
                image_path: p.to_string(),
                image_id: i as i64,
                image_flags: 0,
            })
            .collect();
        let mut cutouts = MemoryCutouts::new(images);
        for (id, number) in [(100, 1), (101, 2), (102, 3)] {
            let epochs = (0..2)
                .map(|icut| MemoryEpoch {
                    info: EpochInfo {
                        file_id: icut,
                        orig_row: 50.0,
                        orig_col: 50.0,
                        orig_start_row: 46.0,
                        orig_start_col: 46.0,
                        jacobian: Jacobian::new(4.0, 4.0, 0.0, 0.263, 0.263, 0.0).unwrap(),
                    },
                    pixels: Some(EpochPixels::new(
                        Image::from_element(9, 9, 1.0),
                        Image::from_element(9, 9, 1.0),
                        IntImage::from_element(9, 9, number as i32),
                    )),
                })
                .collect();
            cutouts.push_object(
                ObjectInfo {
                    id,
                    number,
                    ncutout: 2,
                    box_size: 9,
                },
                epochs,
            );
        }
        cutouts
    }

    fn inputs() -> SurveyInputs {
        let band: Arc<dyn CutoutSource> = Arc::new(source());
        SurveyInputs::new(vec![band], Arc::new(GaussianPsf::new(vec![1.0], 11)))
    }

    #[test]
    fn test_iterates_every_group_once() {
        let assembler = GroupAssembler::new(inputs(), AssemblyParams::default()).unwrap();
        assert_eq!(assembler.groups(), &[0, 1, 2]);
        let iter = assembler.iter();
        assert_eq!(iter.len(), 3);
        let fofids: Vec<GroupId> = iter.map(|g| g.unwrap().fofid).collect();
        assert_eq!(fofids, vec![0, 1, 2]);
    }

    #[test]
    fn test_group_table_and_object_flags() {
        let groups = GroupTable::new(vec![
            GroupRecord { fofid: 4, number: 1 },
            GroupRecord { fofid: 9, number: 2 },
            GroupRecord { fofid: 4, number: 3 },
        ]);
        let obj_flags = ObjectFlagTable::new([ObjectFlagRecord {
            id: 102,
            flags: BAD_OBJ,
        }])
        .unwrap();
        let inputs = inputs().with_groups(groups).with_obj_flags(obj_flags);
        let assembler = GroupAssembler::new(inputs, AssemblyParams::default()).unwrap();
        assert_eq!(assembler.groups(), &[4, 9]);

        let group = assembler.assemble(4).unwrap();
        assert_eq!(group.rows, vec![0, 2]);
        assert_eq!(group.coadd[0].fofid(), 4);
        assert_eq!(group.epochs[1].meta.fofid, 4);
        assert_eq!(group.coadd[0].obj_flags, 0);
        assert_eq!(group.coadd[1].obj_flags, BAD_OBJ);
        assert_eq!(group.epochs[1].obj_flags, BAD_OBJ);
        // neighbors are off by default
        assert!(group.coadd[0].bands[0][0].nbrs.is_none());

        assert_eq!(assembler.assemble(5).unwrap_err(), MofError::UnknownGroup(5));
    }

    #[test]
    fn test_neighbor_modeling() {
        let groups = GroupTable::new(vec![
            GroupRecord { fofid: 0, number: 1 },
            GroupRecord { fofid: 0, number: 2 },
            GroupRecord { fofid: 1, number: 3 },
        ]);
        let params = AssemblyParams::builder().model_nbrs(true).build().unwrap();
        let assembler = GroupAssembler::new(inputs().with_groups(groups), params).unwrap();

        let group = assembler.assemble(0).unwrap();
        assert_eq!(group.len(), 2);
        assert_eq!(group.epochs[0].nbrs_ids, vec![101]);
        assert_eq!(group.epochs[1].cen_ind, Some(1));
        let geom = group.epochs[0].bands[0][0].nbrs.as_ref().unwrap();
        assert_eq!(geom.flags, vec![0]);

        let single = assembler.assemble(1).unwrap();
        assert!(single.coadd[0].nbrs_inds.is_empty());
        assert!(single.coadd[0].bands[0][0].nbrs.as_ref().unwrap().is_empty());
    }

    #[test]
    fn test_requires_a_band() {
        let inputs = SurveyInputs::new(vec![], Arc::new(GaussianPsf::new(vec![], 11)));
        assert!(matches!(
            GroupAssembler::new(inputs, AssemblyParams::default()),
            Err(MofError::NoBands)
        ));
    }
}
