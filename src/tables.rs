//! # Auxiliary tables
//!
//! Small survey tables that steer the assembly, loaded once at initialization into immutable
//! structures:
//!
//! | table               | format | columns / content                          |
//! |---------------------|--------|--------------------------------------------|
//! | [`GroupTable`]      | CSV    | `fofid,number`                             |
//! | [`NeighborTable`]   | CSV    | `number,nbr_number` (`-1` = no neighbor)   |
//! | [`ObjectFlagTable`] | CSV    | `id,flags`                                 |
//! | [`AstromFlags`]     | CSV    | `imageid,astrom_flag`                      |
//! | [`ReplacementFlags`]| JSON   | `{"<expid>-<ccd:02>": flags, ...}`         |
//!
//! Every loader comes in a `from_*_path` flavor taking a [`camino::Utf8Path`] and a
//! `from_reader` / `from_json_str` flavor for in-memory data.
use std::{collections::HashMap, io::Read};

use camino::Utf8Path;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info};

use crate::{
    constants::{GroupId, ObjectId, ObjectNumber, NO_NEIGHBOR},
    mofprep_errors::MofError,
};

// -------------------------------------------------------------------------------------------------
// Groups
// -------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct GroupRecord {
    pub fofid: GroupId,
    pub number: ObjectNumber,
}

/// Friends-of-friends membership, one record per catalog row, in row order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GroupTable {
    records: Vec<GroupRecord>,
}

impl GroupTable {
    pub fn new(records: Vec<GroupRecord>) -> Self {
        GroupTable { records }
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, MofError> {
        let mut csv_reader = csv::Reader::from_reader(reader);
        let records = csv_reader
            .deserialize::<GroupRecord>()
            .collect::<Result<Vec<_>, _>>()?;
        Ok(GroupTable { records })
    }

    pub fn from_csv_path(path: &Utf8Path) -> Result<Self, MofError> {
        info!("reading fof data: {path}");
        let mut csv_reader = csv::Reader::from_path(path)?;
        let records = csv_reader
            .deserialize::<GroupRecord>()
            .collect::<Result<Vec<_>, _>>()?;
        Ok(GroupTable { records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[GroupRecord] {
        &self.records
    }

    pub fn numbers(&self) -> impl Iterator<Item = ObjectNumber> + '_ {
        self.records.iter().map(|r| r.number)
    }
}

// -------------------------------------------------------------------------------------------------
// Neighbors
// -------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct NeighborRecord {
    pub number: ObjectNumber,
    pub nbr_number: ObjectNumber,
}

/// Neighbor pairs `number → nbr_number`, kept in file order for each central object.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NeighborTable {
    pairs: HashMap<ObjectNumber, Vec<ObjectNumber>>,
}

impl NeighborTable {
    pub fn new(records: impl IntoIterator<Item = NeighborRecord>) -> Self {
        let mut pairs: HashMap<ObjectNumber, Vec<ObjectNumber>> = HashMap::new();
        for rec in records {
            let entry = pairs.entry(rec.number).or_default();
            if rec.nbr_number != NO_NEIGHBOR {
                entry.push(rec.nbr_number);
            }
        }
        NeighborTable { pairs }
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, MofError> {
        let mut csv_reader = csv::Reader::from_reader(reader);
        let records = csv_reader
            .deserialize::<NeighborRecord>()
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(records))
    }

    pub fn from_csv_path(path: &Utf8Path) -> Result<Self, MofError> {
        info!("reading nbrs data: {path}");
        Self::from_reader(std::fs::File::open(path)?)
    }

    /// Catalog numbers listed as neighbors of `number`, `-1` entries excluded.
    pub fn neighbors_of(&self, number: ObjectNumber) -> &[ObjectNumber] {
        self.pairs.get(&number).map(Vec::as_slice).unwrap_or(&[])
    }
}

// -------------------------------------------------------------------------------------------------
// Object flags
// -------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct ObjectFlagRecord {
    pub id: ObjectId,
    pub flags: i64,
}

/// External object-level flags, OR'ed into `obj_flags` of the matching objects.
///
/// Only non-zero flags are retained; an object id may appear at most once with non-zero flags.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObjectFlagTable {
    flags: HashMap<ObjectId, i64>,
}

impl ObjectFlagTable {
    pub fn new(records: impl IntoIterator<Item = ObjectFlagRecord>) -> Result<Self, MofError> {
        let mut flags = HashMap::new();
        for rec in records.into_iter().filter(|r| r.flags != 0) {
            if flags.insert(rec.id, rec.flags).is_some() {
                return Err(MofError::InvariantViolation(format!(
                    "object id {} appears more than once in the object flags",
                    rec.id
                )));
            }
        }
        Ok(ObjectFlagTable { flags })
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, MofError> {
        let mut csv_reader = csv::Reader::from_reader(reader);
        let records = csv_reader
            .deserialize::<ObjectFlagRecord>()
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(records)
    }

    pub fn from_csv_path(path: &Utf8Path) -> Result<Self, MofError> {
        info!("reading object flags: {path}");
        Self::from_reader(std::fs::File::open(path)?)
    }

    /// Non-zero flags of `id`, if any.
    pub fn flags_for(&self, id: ObjectId) -> Option<i64> {
        self.flags.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }
}

// -------------------------------------------------------------------------------------------------
// Image flags
// -------------------------------------------------------------------------------------------------

/// Replacement image flags keyed by exposure and chip.
///
/// Single-epoch image names follow `<prefix>_<expid>_<ccd>[_<suffix>].<ext>`; the key of such an
/// image is `"<expid>-<ccd:02>"`, e.g. `D00232321_232321_07_immasked.fits` → `"232321-07"`.
#[derive(Debug, Clone)]
pub struct ReplacementFlags {
    data: HashMap<String, i64>,
    name_regex: Regex,
}

impl ReplacementFlags {
    pub fn new(data: HashMap<String, i64>) -> Result<Self, MofError> {
        let name_regex = Regex::new(r"^[^_]*_(\d+)_(\d+)(?:[._]|$)")?;
        Ok(ReplacementFlags { data, name_regex })
    }

    pub fn from_json_str(json: &str) -> Result<Self, MofError> {
        Self::new(serde_json::from_str(json)?)
    }

    pub fn from_json_path(path: &Utf8Path) -> Result<Self, MofError> {
        info!("reading replacement flags: {path}");
        let file = std::fs::File::open(path)?;
        Self::new(serde_json::from_reader(std::io::BufReader::new(file))?)
    }

    /// Key of an image path, computed from its base name.
    pub fn key_for(&self, image_path: &str) -> Result<String, MofError> {
        let bname = Utf8Path::new(image_path).file_name().unwrap_or(image_path);
        let caps = self
            .name_regex
            .captures(bname)
            .ok_or_else(|| MofError::InvalidImageName(image_path.to_string()))?;
        let parse = |i: usize| -> Result<u64, MofError> {
            caps[i]
                .parse::<u64>()
                .map_err(|_| MofError::InvalidImageName(image_path.to_string()))
        };
        Ok(format!("{}-{:02}", parse(1)?, parse(2)?))
    }

    /// Replacement flags of an image, `default` when its key is absent.
    pub fn flags_for(&self, image_path: &str, default: i64) -> Result<i64, MofError> {
        let key = self.key_for(image_path)?;
        Ok(self.data.get(&key).copied().unwrap_or(default))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct AstromFlagRecord {
    pub imageid: i64,
    pub astrom_flag: i64,
}

/// Replacement astrometry flags keyed by survey image id.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AstromFlags {
    flags: HashMap<i64, i64>,
}

impl AstromFlags {
    /// Flags reported for images absent from the table.
    pub const NOT_FOUND: i64 = 1;

    pub fn new(records: impl IntoIterator<Item = AstromFlagRecord>) -> Self {
        AstromFlags {
            flags: records
                .into_iter()
                .map(|r| (r.imageid, r.astrom_flag))
                .collect(),
        }
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, MofError> {
        let mut csv_reader = csv::Reader::from_reader(reader);
        let records = csv_reader
            .deserialize::<AstromFlagRecord>()
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(records))
    }

    pub fn from_csv_path(path: &Utf8Path) -> Result<Self, MofError> {
        info!("reading astrometry flags: {path}");
        Self::from_reader(std::fs::File::open(path)?)
    }

    pub fn flags_for(&self, image_id: i64) -> i64 {
        self.flags.get(&image_id).copied().unwrap_or(Self::NOT_FOUND)
    }

    /// Flags of several images; unmatched ids are flagged.
    pub fn flags_multi(&self, image_ids: &[i64]) -> Vec<i64> {
        let nmiss = image_ids
            .iter()
            .filter(|id| !self.flags.contains_key(id))
            .count();
        if nmiss > 0 {
            debug!(
                "{nmiss}/{} did not match astrom flags",
                image_ids.len()
            );
        }
        image_ids.iter().map(|&id| self.flags_for(id)).collect()
    }
}
