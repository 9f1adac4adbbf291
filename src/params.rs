//! # Assembly parameters
//!
//! This module defines [`AssemblyParams`], the configuration of a processing unit, and its
//! validating builder [`AssemblyParamsBuilder`].
//!
//! ## Purpose
//!
//! [`AssemblyParams`] centralizes every switch of the assembly pipeline:
//!
//! - Which weight map(s) to read for each cutout ([`WeightPolicy`]) and the weight floor,
//! - Statistical outlier rejection across single epochs,
//! - Image-quality reduction (`image_flags_to_check`),
//! - Era-specific behavior that used to live in format subclasses: pixel-scale
//!   normalization, saturation/star-mask propagation, stellar-halo flagging,
//! - Neighbor modeling and the processing-unit group range.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mofprep::params::{AssemblyParams, WeightPolicy};
//!
//! let params = AssemblyParams::builder()
//!     .weight_policy(WeightPolicy::Mof)
//!     .model_nbrs(true)
//!     .propagate_sat_starpix(true)
//!     .group_range(0..100)
//!     .build()
//!     .unwrap();
//! ```
//!
//! Parameters can also be read from JSON, unspecified fields keeping their default:
//!
//! ```rust,no_run
//! use mofprep::params::AssemblyParams;
//!
//! let params = AssemblyParams::from_json_str(r#"{"weight_policy": "cweight-nearest"}"#).unwrap();
//! ```
use std::{fmt, ops::Range, str::FromStr};

use serde::Deserialize;

use crate::{
    constants::{BMASK_INTERP, BMASK_SAT, BMASK_SAT_EXCLUDE, BMASK_STAR},
    cutouts::WeightKind,
    mofprep_errors::MofError,
};

/// Which weight map(s) an observation is built from.
///
/// | name              | `weight`                    | `weight_us`                 |
/// |-------------------|-----------------------------|-----------------------------|
/// | `weight`          | plain inverse variance      | –                           |
/// | `cweight-nearest` | seg-aware, nearest object   | –                           |
/// | `seg_and_sky`     | seg-aware                   | –                           |
/// | `mof`             | plain inverse variance      | seg-aware, nearest object   |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum WeightPolicy {
    Weight,
    CWeightNearest,
    SegAndSky,
    Mof,
}

impl WeightPolicy {
    pub fn name(&self) -> &'static str {
        match self {
            WeightPolicy::Weight => "weight",
            WeightPolicy::CWeightNearest => "cweight-nearest",
            WeightPolicy::SegAndSky => "seg_and_sky",
            WeightPolicy::Mof => "mof",
        }
    }

    /// Weight map used for the observation's `weight` and `weight_raw`.
    pub fn primary(&self) -> WeightKind {
        match self {
            WeightPolicy::Weight | WeightPolicy::Mof => WeightKind::Weight,
            WeightPolicy::CWeightNearest => WeightKind::SegAwareNearest,
            WeightPolicy::SegAndSky => WeightKind::SegAware,
        }
    }

    /// Weight map used for the observation's `weight_us`, if any.
    pub fn unsmoothed(&self) -> Option<WeightKind> {
        match self {
            WeightPolicy::Mof => Some(WeightKind::SegAwareNearest),
            _ => None,
        }
    }
}

impl FromStr for WeightPolicy {
    type Err = MofError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "weight" => Ok(WeightPolicy::Weight),
            "cweight-nearest" => Ok(WeightPolicy::CWeightNearest),
            "seg_and_sky" => Ok(WeightPolicy::SegAndSky),
            "mof" => Ok(WeightPolicy::Mof),
            other => Err(MofError::UnknownWeightPolicy(other.to_string())),
        }
    }
}

impl TryFrom<String> for WeightPolicy {
    type Error = MofError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for WeightPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Bit pattern selecting the pixels of a bitmask that are propagated across epochs.
///
/// A pixel is selected when at least one bit of `any_of` is set, all bits of `all_of` are
/// set and no bit of `none_of` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MaskBitSelection {
    pub any_of: i32,
    pub all_of: i32,
    pub none_of: i32,
}

impl Default for MaskBitSelection {
    /// Saturated or interpolated pixels inside a star mask, without any disqualifying plane.
    fn default() -> Self {
        MaskBitSelection {
            any_of: BMASK_SAT | BMASK_INTERP,
            all_of: BMASK_STAR,
            none_of: BMASK_SAT_EXCLUDE,
        }
    }
}

impl MaskBitSelection {
    #[inline]
    pub fn matches(&self, value: i32) -> bool {
        (value & self.any_of) != 0
            && (value & self.all_of) == self.all_of
            && (value & self.none_of) == 0
    }
}

/// Configuration of a processing unit.
///
/// Validity rules (checked by [`AssemblyParamsBuilder::build`] and
/// [`AssemblyParams::from_json_str`]):
/// * `min_weight` is not NaN,
/// * `outlier_nsigma > 0` and `outlier_a ≥ 0`,
/// * `sat_mask_bits.any_of ≠ 0` and `stellar_halo_bit ≠ 0`,
/// * `group_range.start ≤ group_range.end`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AssemblyParams {
    // --- Observation building ---
    pub weight_policy: WeightPolicy,
    /// Weights strictly below this value are set to zero.
    pub min_weight: f64,
    pub reject_outliers: bool,
    pub outlier_nsigma: f64,
    /// Fractional model error added to the outlier χ² denominator.
    pub outlier_a: f64,
    /// Divide images by the pixel area and multiply weights by its square.
    pub normalize_pixel_scale: bool,

    // --- Image quality ---
    /// Raw image-flag bits that make an image unusable.
    pub image_flags_to_check: i64,

    // --- Bitmask propagation ---
    pub propagate_sat_starpix: bool,
    pub sat_mask_bits: MaskBitSelection,
    pub mask_dilation_rounds: usize,
    pub flag_stellar_halo: bool,
    pub stellar_halo_bit: i32,

    // --- Groups / neighbors ---
    pub model_nbrs: bool,
    /// Positions in the sorted group list handled by this processing unit.
    pub group_range: Option<Range<usize>>,
}

impl Default for AssemblyParams {
    fn default() -> Self {
        AssemblyParams {
            weight_policy: WeightPolicy::Weight,
            min_weight: f64::NEG_INFINITY,
            reject_outliers: true,
            outlier_nsigma: 5.0,
            outlier_a: 0.3,
            normalize_pixel_scale: false,
            image_flags_to_check: 0,
            propagate_sat_starpix: false,
            sat_mask_bits: MaskBitSelection::default(),
            mask_dilation_rounds: 2,
            flag_stellar_halo: false,
            stellar_halo_bit: BMASK_STAR,
            model_nbrs: false,
            group_range: None,
        }
    }
}

impl AssemblyParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> AssemblyParamsBuilder {
        AssemblyParamsBuilder::new()
    }

    /// Deserialize parameters from a JSON object and validate them.
    ///
    /// Missing fields take their default value; an unknown `weight_policy` name is reported as
    /// [`MofError::UnknownWeightPolicy`].
    pub fn from_json_str(json: &str) -> Result<Self, MofError> {
        let params: AssemblyParams = serde_json::from_str(json).map_err(|err| {
            // serde only keeps the message of the TryFrom error
            let msg = err.to_string();
            match msg.strip_prefix("No support for weighting policy: ") {
                Some(rest) => {
                    let name = rest.split(" at line").next().unwrap_or(rest);
                    MofError::UnknownWeightPolicy(name.to_string())
                }
                None => MofError::JsonError(err),
            }
        })?;
        params.validate()?;
        Ok(params)
    }

    fn validate(&self) -> Result<(), MofError> {
        if self.min_weight.is_nan() {
            return Err(MofError::InvalidParameter("min_weight must not be NaN".into()));
        }
        if !(self.outlier_nsigma > 0.0) {
            return Err(MofError::InvalidParameter(
                "outlier_nsigma must be > 0".into(),
            ));
        }
        if !(self.outlier_a >= 0.0) {
            return Err(MofError::InvalidParameter("outlier_a must be >= 0".into()));
        }
        if self.sat_mask_bits.any_of == 0 {
            return Err(MofError::InvalidParameter(
                "sat_mask_bits.any_of must select at least one bit".into(),
            ));
        }
        if self.stellar_halo_bit == 0 {
            return Err(MofError::InvalidParameter(
                "stellar_halo_bit must be non-zero".into(),
            ));
        }
        if let Some(range) = &self.group_range {
            if range.start > range.end {
                return Err(MofError::InvalidParameter(format!(
                    "group_range {}..{} is reversed",
                    range.start, range.end
                )));
            }
        }
        Ok(())
    }
}

/// Builder for [`AssemblyParams`], with validation.
#[derive(Debug, Clone, Default)]
pub struct AssemblyParamsBuilder {
    params: AssemblyParams,
}

impl AssemblyParamsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn weight_policy(mut self, v: WeightPolicy) -> Self {
        self.params.weight_policy = v;
        self
    }

    /// Select the weight policy by name; an unknown name is a [`MofError::UnknownWeightPolicy`].
    pub fn weight_policy_name(self, name: &str) -> Result<Self, MofError> {
        Ok(self.weight_policy(name.parse()?))
    }

    pub fn min_weight(mut self, v: f64) -> Self {
        self.params.min_weight = v;
        self
    }

    pub fn reject_outliers(mut self, v: bool) -> Self {
        self.params.reject_outliers = v;
        self
    }

    pub fn outlier_nsigma(mut self, v: f64) -> Self {
        self.params.outlier_nsigma = v;
        self
    }

    pub fn outlier_a(mut self, v: f64) -> Self {
        self.params.outlier_a = v;
        self
    }

    pub fn normalize_pixel_scale(mut self, v: bool) -> Self {
        self.params.normalize_pixel_scale = v;
        self
    }

    pub fn image_flags_to_check(mut self, v: i64) -> Self {
        self.params.image_flags_to_check = v;
        self
    }

    pub fn propagate_sat_starpix(mut self, v: bool) -> Self {
        self.params.propagate_sat_starpix = v;
        self
    }

    pub fn sat_mask_bits(mut self, v: MaskBitSelection) -> Self {
        self.params.sat_mask_bits = v;
        self
    }

    pub fn mask_dilation_rounds(mut self, v: usize) -> Self {
        self.params.mask_dilation_rounds = v;
        self
    }

    pub fn flag_stellar_halo(mut self, v: bool) -> Self {
        self.params.flag_stellar_halo = v;
        self
    }

    pub fn stellar_halo_bit(mut self, v: i32) -> Self {
        self.params.stellar_halo_bit = v;
        self
    }

    pub fn model_nbrs(mut self, v: bool) -> Self {
        self.params.model_nbrs = v;
        self
    }

    pub fn group_range(mut self, v: Range<usize>) -> Self {
        self.params.group_range = Some(v);
        self
    }

    /// Finalize the builder.
    ///
    /// Return
    /// ------
    /// * `Ok(AssemblyParams)` when every validity rule holds,
    /// * `Err(MofError::InvalidParameter)` naming the first violated rule otherwise.
    pub fn build(self) -> Result<AssemblyParams, MofError> {
        self.params.validate()?;
        Ok(self.params)
    }
}

impl fmt::Display for AssemblyParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AssemblyParams(weight_policy={}, min_weight={}, reject_outliers={} ({}σ, A={}), model_nbrs={}, image_flags_to_check={}, normalize_pixel_scale={}, propagate_sat_starpix={}, flag_stellar_halo={}, group_range={:?})",
            self.weight_policy,
            self.min_weight,
            self.reject_outliers,
            self.outlier_nsigma,
            self.outlier_a,
            self.model_nbrs,
            self.image_flags_to_check,
            self.normalize_pixel_scale,
            self.propagate_sat_starpix,
            self.flag_stellar_halo,
            self.group_range,
        )
    }
}

#[cfg(test)]
mod params_test {
    use super::*;

    #[test]
    fn test_defaults() {
        let params = AssemblyParams::default();
        assert_eq!(params.weight_policy, WeightPolicy::Weight);
        assert_eq!(params.min_weight, f64::NEG_INFINITY);
        assert!(params.reject_outliers);
        assert_eq!(params.outlier_nsigma, 5.0);
        assert_eq!(params.mask_dilation_rounds, 2);
        assert_eq!(params.sat_mask_bits.none_of, 3993);
        assert!(AssemblyParams::builder().build().is_ok());
    }

    #[test]
    fn test_weight_policy_names() {
        for name in ["weight", "cweight-nearest", "seg_and_sky", "mof"] {
            let policy: WeightPolicy = name.parse().unwrap();
            assert_eq!(policy.name(), name);
        }
        assert_eq!(
            "region".parse::<WeightPolicy>(),
            Err(MofError::UnknownWeightPolicy("region".into()))
        );
        assert_eq!(WeightPolicy::Mof.unsmoothed(), Some(WeightKind::SegAwareNearest));
        assert_eq!(WeightPolicy::Mof.primary(), WeightKind::Weight);
    }

    #[test]
    fn test_builder_validation() {
        let err = AssemblyParams::builder().outlier_nsigma(0.0).build();
        assert!(matches!(err, Err(MofError::InvalidParameter(_))));

        let err = AssemblyParams::builder().min_weight(f64::NAN).build();
        assert!(matches!(err, Err(MofError::InvalidParameter(_))));

        #[allow(clippy::reversed_empty_ranges)]
        let err = AssemblyParams::builder().group_range(5..2).build();
        assert!(matches!(err, Err(MofError::InvalidParameter(_))));

        let err = AssemblyParams::builder().weight_policy_name("nope");
        assert_eq!(
            err.unwrap_err(),
            MofError::UnknownWeightPolicy("nope".into())
        );
    }

    #[test]
    fn test_from_json() {
        let params = AssemblyParams::from_json_str(
            r#"{"weight_policy": "mof", "model_nbrs": true, "group_range": {"start": 2, "end": 4}}"#,
        )
        .unwrap();
        assert_eq!(params.weight_policy, WeightPolicy::Mof);
        assert!(params.model_nbrs);
        assert_eq!(params.group_range, Some(2..4));
        assert!(params.reject_outliers);

        let err = AssemblyParams::from_json_str(r#"{"weight_policy": "bogus"}"#);
        assert_eq!(
            err.unwrap_err(),
            MofError::UnknownWeightPolicy("bogus".into())
        );
    }

    #[test]
    fn test_mask_bit_selection() {
        let sel = MaskBitSelection::default();
        assert!(sel.matches(2 | 32));
        assert!(sel.matches(4 | 32));
        assert!(!sel.matches(2));
        assert!(!sel.matches(32));
        assert!(!sel.matches(2 | 32 | 1));
        assert!(!sel.matches(4 | 32 | 2048));
    }
}
