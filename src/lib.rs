//! Observation assembly for multi-object fitting of survey cutouts.
//!
//! Objects are grouped (friends-of-friends), and every member of a group is turned into a
//! reference-epoch and a single-epoch [`MultiBandObsList`](observations::MultiBandObsList),
//! with neighbor geometry attached. Entry point: [`assembler::GroupAssembler`].
pub mod assembler;
pub mod bitmask;
pub mod builder;
pub mod constants;
pub mod cutouts;
pub mod groups;
pub mod image_flags;
pub mod jacobian;
pub mod mofprep_errors;
pub mod neighbors;
pub mod observations;
pub mod params;
pub mod sphere;
pub mod tables;
