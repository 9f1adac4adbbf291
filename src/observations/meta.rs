//! Typed meta-data records written next to fit results.
//!
//! Every field is pre-filled with its default ([`DEFVAL`] / [`BIG_DEFVAL`]) before being
//! populated, so a record that was only partially filled (e.g. for a flagged epoch) still
//! carries recognizable sentinel values.
use serde::Serialize;

use crate::constants::{FileId, GroupId, ObjectId, ObjectNumber, BIG_DEFVAL, DEFVAL};

/// Object-level record, one per object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectMeta {
    pub id: ObjectId,
    pub number: ObjectNumber,
    /// Number of single-epoch images per band
    pub nimage_tot: Vec<i32>,
    pub fofid: GroupId,
}

impl ObjectMeta {
    pub fn new(nband: usize) -> Self {
        ObjectMeta {
            id: DEFVAL,
            number: DEFVAL,
            nimage_tot: vec![DEFVAL as i32; nband],
            fofid: DEFVAL,
        }
    }
}

/// Epoch-level record, one per observation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochMeta {
    pub id: ObjectId,
    pub number: ObjectNumber,
    pub band_num: i16,
    pub cutout_index: i32,
    pub orig_row: f64,
    pub orig_col: f64,
    pub file_id: i32,
    pub pixel_scale: f64,
    /// Survey image id of the originating image
    pub image_id: i64,
}

impl Default for EpochMeta {
    fn default() -> Self {
        EpochMeta {
            id: DEFVAL,
            number: DEFVAL,
            band_num: DEFVAL as i16,
            cutout_index: DEFVAL as i32,
            orig_row: BIG_DEFVAL,
            orig_col: BIG_DEFVAL,
            file_id: DEFVAL as i32,
            pixel_scale: BIG_DEFVAL,
            image_id: DEFVAL,
        }
    }
}

impl EpochMeta {
    pub fn file_id(&self) -> Option<FileId> {
        usize::try_from(self.file_id).ok()
    }
}
