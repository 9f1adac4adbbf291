//! # Group index
//!
//! Objects are processed in friends-of-friends groups. [`GroupIndex`] translates between
//! catalog rows and group ids, after checking that the per-band catalogs and the group table
//! describe the same objects in the same order.
//!
//! ## Indexing
//!
//! ```text
//! row   : 0-offset position of an object in every band catalog and in the group table
//! fofid : group id, as given by the group table (row index when there is no table)
//! ```
//!
//! The processing unit is a contiguous slice of the sorted group ids, selected by
//! [`AssemblyParams::group_range`](crate::params::AssemblyParams::group_range).
use std::{collections::BTreeMap, ops::Range};

use itertools::Itertools;
use tracing::info;

use crate::{
    constants::{GroupId, ObjectNumber, RowIndex},
    mofprep_errors::MofError,
    tables::GroupTable,
};

#[derive(Debug, Clone, PartialEq)]
pub struct GroupIndex {
    /// Rows of every group, keyed and ordered by group id
    members: BTreeMap<GroupId, Vec<RowIndex>>,
    /// Group ids of the processing unit, sorted
    unit: Vec<GroupId>,
    row_to_group: Vec<GroupId>,
    numbers: Vec<ObjectNumber>,
}

impl GroupIndex {
    /// Build and validate the group index.
    ///
    /// Arguments
    /// ---------
    /// * `band_numbers`: the catalog number column of every band, in row order
    /// * `table`: optional group table; without one every row is its own group
    /// * `range`: positions in the sorted list of group ids forming the processing unit
    ///   (clamped to the number of groups), `None` for every group
    ///
    /// Return
    /// ------
    /// * the index, or a configuration error:
    ///   [`MofError::NoBands`], [`MofError::ObjectCountMismatch`] or
    ///   [`MofError::NumberMismatch`]. Groups are collected from the rows, so none is empty.
    pub fn new(
        band_numbers: &[Vec<ObjectNumber>],
        table: Option<&GroupTable>,
        range: Option<Range<usize>>,
    ) -> Result<Self, MofError> {
        info!("making fof indexes");

        let reference = band_numbers.first().ok_or(MofError::NoBands)?;
        let nobj = reference.len();

        for (band, numbers) in band_numbers.iter().enumerate().skip(1) {
            if numbers.len() != nobj {
                return Err(MofError::ObjectCountMismatch {
                    band,
                    expected: nobj,
                    found: numbers.len(),
                });
            }
            if numbers != reference {
                return Err(MofError::NumberMismatch(format!("band {band}")));
            }
        }

        let row_to_group: Vec<GroupId> = match table {
            Some(table) => {
                if table.len() != nobj || !table.numbers().eq(reference.iter().copied()) {
                    return Err(MofError::NumberMismatch("the fof table".into()));
                }
                table.records().iter().map(|r| r.fofid).collect()
            }
            None => (0..nobj as GroupId).collect(),
        };

        let mut members: BTreeMap<GroupId, Vec<RowIndex>> = BTreeMap::new();
        for (row, &fofid) in row_to_group.iter().enumerate() {
            members.entry(fofid).or_default().push(row);
        }

        let ngroups = members.len();
        let unit = match range {
            Some(range) => {
                let start = range.start.min(ngroups);
                let end = range.end.clamp(start, ngroups);
                members.keys().copied().skip(start).take(end - start).collect()
            }
            None => members.keys().copied().collect_vec(),
        };

        info!(
            "{} objects in {} groups, {} in this processing unit",
            nobj,
            ngroups,
            unit.len()
        );

        Ok(GroupIndex {
            members,
            unit,
            row_to_group,
            numbers: reference.clone(),
        })
    }

    /// Sorted group ids of the processing unit.
    pub fn group_ids(&self) -> &[GroupId] {
        &self.unit
    }

    pub fn num_groups(&self) -> usize {
        self.unit.len()
    }

    /// Rows of a group, in catalog order.
    pub fn rows(&self, fofid: GroupId) -> Result<&[RowIndex], MofError> {
        self.members
            .get(&fofid)
            .map(Vec::as_slice)
            .ok_or(MofError::UnknownGroup(fofid))
    }

    pub fn group_of_row(&self, row: RowIndex) -> Option<GroupId> {
        self.row_to_group.get(row).copied()
    }

    pub fn number(&self, row: RowIndex) -> Option<ObjectNumber> {
        self.numbers.get(row).copied()
    }

    pub fn num_objects(&self) -> usize {
        self.numbers.len()
    }
}
