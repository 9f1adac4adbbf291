//! # Constants and type definitions for mofprep
//!
//! This module centralizes the **flag bits**, **default values**, **unit conversions** and
//! **common type aliases** used throughout the crate.
//!
//! ## Overview
//!
//! - Object-level and observation-level status bits
//! - Default values used to pre-fill typed meta records
//! - Degree / arcsecond / radian conversions
//! - Index and identifier aliases shared by every component

use nalgebra::DMatrix;

// -------------------------------------------------------------------------------------------------
// Flag bits
// -------------------------------------------------------------------------------------------------

/// The object itself is bad (set by an external object-flag table)
pub const BAD_OBJ: i64 = 1 << 25;

/// Status of an [`Observation`](crate::observations::Observation) whose image was rejected
/// by the image-quality reduction or could not be read
pub const IMAGE_FLAGS: i64 = 1 << 26;

/// The object has no cutouts at all
pub const NO_CUTOUTS: i64 = 1 << 27;

/// The cutout box is too large to be processed
pub const BOX_SIZE_TOO_BIG: i64 = 1 << 28;

/// Unrecoverable failure during processing
pub const UTTER_FAILURE: i64 = 1 << 29;

/// No attempt was made to process the object
pub const NO_ATTEMPT: i64 = 1 << 30;

/// Reduced, run-specific image flag: the image failed the `image_flags_to_check` test
pub const IMAGE_FLAGS_SET: i64 = 1;

/// Object-level flag raised when the object's own footprint touches a masked stellar halo
pub const OBJ_FLAG_STELLAR_HALO: i64 = 1;

/// Neighbor flag: neighbor geometry is usable
pub const NBR_OK: i32 = 0;

/// Neighbor flag: neighbor geometry is missing or the neighbor itself is flagged
pub const NBR_FLAGGED: i32 = 1;

// -------------------------------------------------------------------------------------------------
// Default values
// -------------------------------------------------------------------------------------------------

/// Fill value for integer and floating meta fields that have not been populated
pub const DEFVAL: i64 = -9999;

/// Positive fill value
pub const PDEFVAL: i64 = 9999;

/// Large negative fill value for floating meta fields
pub const BIG_DEFVAL: f64 = -9.999e9;

/// Large positive fill value for floating meta fields
pub const BIG_PDEFVAL: f64 = 9.999e9;

/// Sentinel used by neighbor lists for "no neighbor"
pub const NO_NEIGHBOR: i64 = -1;

// -------------------------------------------------------------------------------------------------
// Bitmask bits (survey bad-pixel mask planes)
// -------------------------------------------------------------------------------------------------

/// Saturated pixel
pub const BMASK_SAT: i32 = 2;

/// Interpolated pixel
pub const BMASK_INTERP: i32 = 4;

/// Pixel inside a bright-star halo / star mask
pub const BMASK_STAR: i32 = 32;

/// Planes that disqualify a pixel from the saturation-propagation pattern
pub const BMASK_SAT_EXCLUDE: i32 = 2048 + 1024 + 512 + 256 + 128 + 16 + 8 + 1;

// -------------------------------------------------------------------------------------------------
// Unit conversions
// -------------------------------------------------------------------------------------------------

/// Degrees → radians
pub const RADEG: f64 = std::f64::consts::PI / 180.0;

/// Radians → arcseconds
pub const ARCSEC_PER_RAD: f64 = 180.0 / std::f64::consts::PI * 3600.0;

// -------------------------------------------------------------------------------------------------
// Type aliases
// -------------------------------------------------------------------------------------------------

/// Angle in degrees
pub type Degree = f64;
/// Angle in arcseconds
pub type ArcSec = f64;
/// Angle in radians
pub type Radian = f64;

/// Row index of an object in the per-band catalogs (0-offset)
pub type RowIndex = usize;
/// Friends-of-friends group identifier
pub type GroupId = i64;
/// Catalog number of an object (the id in the detection segmentation map)
pub type ObjectNumber = i64;
/// Survey-wide object identifier
pub type ObjectId = i64;
/// Index of an image in a band's image table (0 = reference/coadd image)
pub type FileId = usize;

/// Floating-point pixel grid (images, weights)
pub type Image = DMatrix<f64>;
/// Integer pixel grid (segmentation maps, bitmasks)
pub type IntImage = DMatrix<i32>;
