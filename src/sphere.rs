//! # Celestial-sphere geometry
//!
//! Unit-vector bases on the celestial sphere and a gnomonic (TAN) world coordinate system.
//!
//! ## Conventions
//!
//! ```text
//! θ = 90° − dec          (co-latitude)
//! φ = −ra                (u grows toward −ra, i.e. east on the sky)
//!
//! r̂ = ( sinθ·cosφ, sinθ·sinφ,  cosθ )
//! θ̂ = ( cosθ·cosφ, cosθ·sinφ, −sinθ )
//! φ̂ = (   −sinφ,      cosφ,     0   )
//!
//! û = φ̂,  v̂ = −θ̂
//! ```
//!
//! With this basis, [`tangent_offset`] returns the `(u, v)` position of one direction in the
//! tangent plane of another, in the same arcsecond units the cutout [`Jacobian`](crate::jacobian::Jacobian)s use.

use std::collections::HashMap;

use nalgebra::{Matrix2, Vector2, Vector3};

use crate::{
    constants::{ArcSec, Degree, FileId, Radian, ARCSEC_PER_RAD, RADEG},
    cutouts::SkyMap,
    mofprep_errors::MofError,
};

/// Orthonormal basis attached to a point of the celestial sphere.
#[derive(Debug, Clone, PartialEq)]
pub struct SphereBasis {
    /// Radial direction
    pub r: Vector3<f64>,
    /// Local `u` direction (increasing φ)
    pub u: Vector3<f64>,
    /// Local `v` direction (increasing dec)
    pub v: Vector3<f64>,
}

/// Convert equatorial coordinates to co-latitude / longitude `(θ, φ)` in radians.
pub fn radec_to_thetaphi(ra: Degree, dec: Degree) -> (Radian, Radian) {
    ((90.0 - dec) * RADEG, -ra * RADEG)
}

/// Build the `(r̂, û, v̂)` basis at co-latitude `theta` and longitude `phi`.
pub fn thetaphi_to_basis(theta: Radian, phi: Radian) -> SphereBasis {
    let (sint, cost) = theta.sin_cos();
    let (sinp, cosp) = phi.sin_cos();

    let rhat = Vector3::new(sint * cosp, sint * sinp, cost);
    let that = Vector3::new(cost * cosp, cost * sinp, -sint);
    let phat = Vector3::new(-sinp, cosp, 0.0);

    SphereBasis {
        r: rhat,
        u: phat,
        v: -that,
    }
}

/// Build the `(r̂, û, v̂)` basis at `(ra, dec)` given in degrees.
pub fn radec_to_basis(ra: Degree, dec: Degree) -> SphereBasis {
    let (theta, phi) = radec_to_thetaphi(ra, dec);
    thetaphi_to_basis(theta, phi)
}

/// Tangent-plane offset of `other` as seen from `center`, in arcseconds.
///
/// The radial unit vector of `other` is projected onto the local `û`, `v̂` basis of `center`
/// and rescaled by `1 / cos(angle)` so that the result is the point where the line of sight
/// to `other` pierces the tangent plane at `center`.
///
/// Return
/// ------
/// * `(u, v)` in arcseconds, or `None` when `other` is 90° or more away from `center`.
pub fn tangent_offset(center: &SphereBasis, other: &SphereBasis) -> Option<(ArcSec, ArcSec)> {
    let cosang = center.r.dot(&other.r);
    if cosang <= 0.0 {
        return None;
    }
    let u = other.r.dot(&center.u) / cosang * ARCSEC_PER_RAD;
    let v = other.r.dot(&center.v) / cosang * ARCSEC_PER_RAD;
    Some((u, v))
}

/// Gnomonic (TAN) world coordinate system of a mosaic image.
///
/// `crpix` follows the FITS convention (1-offset, `x` along columns); `cd` is in degrees per
/// pixel and `crval` is the reference `(ra, dec)` in degrees. The public methods take
/// 0-offset `(row, col)` positions.
#[derive(Debug, Clone, PartialEq)]
pub struct TanWcs {
    pub crpix: (f64, f64),
    pub crval: (Degree, Degree),
    pub cd: Matrix2<f64>,
}

impl TanWcs {
    pub fn new(crpix: (f64, f64), crval: (Degree, Degree), cd: Matrix2<f64>) -> Self {
        TanWcs { crpix, crval, cd }
    }

    /// Sky position `(ra, dec)` in degrees of a 0-offset pixel position.
    pub fn image_to_sky(&self, row: f64, col: f64) -> (Degree, Degree) {
        let x = col + 1.0 - self.crpix.0;
        let y = row + 1.0 - self.crpix.1;
        let xieta = self.cd * Vector2::new(x, y);
        let xi = xieta.x * RADEG;
        let eta = xieta.y * RADEG;

        let ra0 = self.crval.0 * RADEG;
        let dec0 = self.crval.1 * RADEG;

        let rho = (xi * xi + eta * eta).sqrt();
        if rho < 1e-15 {
            return self.crval;
        }
        let c = rho.atan();
        let (sin_c, cos_c) = c.sin_cos();
        let (sin_dec0, cos_dec0) = dec0.sin_cos();

        let dec = (cos_c * sin_dec0 + eta * sin_c * cos_dec0 / rho).asin();
        let ra = ra0 + (xi * sin_c).atan2(rho * cos_dec0 * cos_c - eta * sin_dec0 * sin_c);

        (ra.to_degrees().rem_euclid(360.0), dec.to_degrees())
    }

    /// 0-offset pixel position `(row, col)` of a sky position, `None` behind the tangent plane.
    pub fn sky_to_image(&self, ra: Degree, dec: Degree) -> Result<Option<(f64, f64)>, MofError> {
        let (ra, dec) = (ra * RADEG, dec * RADEG);
        let (ra0, dec0) = (self.crval.0 * RADEG, self.crval.1 * RADEG);
        let da = ra - ra0;
        let (sin_dec, cos_dec) = dec.sin_cos();
        let (sin_dec0, cos_dec0) = dec0.sin_cos();
        let cos_da = da.cos();

        let denom = sin_dec * sin_dec0 + cos_dec * cos_dec0 * cos_da;
        if denom <= 1e-12 {
            return Ok(None);
        }
        let xi = (cos_dec * da.sin() / denom).to_degrees();
        let eta = ((sin_dec * cos_dec0 - cos_dec * sin_dec0 * cos_da) / denom).to_degrees();

        let cd_inv = self
            .cd
            .try_inverse()
            .ok_or(MofError::SingularJacobian(self.cd.determinant()))?;
        let xy = cd_inv * Vector2::new(xi, eta);
        Ok(Some((xy.y + self.crpix.1 - 1.0, xy.x + self.crpix.0 - 1.0)))
    }
}

/// Per-band lookup of mosaic WCS solutions, keyed by image index.
#[derive(Debug, Clone, Default)]
pub struct WcsCatalog {
    solutions: HashMap<(usize, FileId), TanWcs>,
}

impl WcsCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, band: usize, file_id: FileId, wcs: TanWcs) {
        self.solutions.insert((band, file_id), wcs);
    }

    pub fn get(&self, band: usize, file_id: FileId) -> Option<&TanWcs> {
        self.solutions.get(&(band, file_id))
    }

    pub fn len(&self) -> usize {
        self.solutions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.solutions.is_empty()
    }
}

impl SkyMap for WcsCatalog {
    fn image_to_sky(
        &self,
        band: usize,
        file_id: FileId,
        row: f64,
        col: f64,
    ) -> Option<(Degree, Degree)> {
        self.get(band, file_id).map(|wcs| wcs.image_to_sky(row, col))
    }
}

#[cfg(test)]
mod sphere_test {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_basis_is_orthonormal() {
        let basis = radec_to_basis(53.2, -27.8);
        assert_relative_eq!(basis.r.norm(), 1.0, epsilon = 1e-14);
        assert_relative_eq!(basis.u.norm(), 1.0, epsilon = 1e-14);
        assert_relative_eq!(basis.v.norm(), 1.0, epsilon = 1e-14);
        assert_relative_eq!(basis.r.dot(&basis.u), 0.0, epsilon = 1e-14);
        assert_relative_eq!(basis.r.dot(&basis.v), 0.0, epsilon = 1e-14);
        assert_relative_eq!(basis.u.dot(&basis.v), 0.0, epsilon = 1e-14);
    }

    #[test]
    fn test_tangent_offset_null() {
        let cen = radec_to_basis(10.0, 20.0);
        let (u, v) = tangent_offset(&cen, &cen).unwrap();
        assert_relative_eq!(u, 0.0, epsilon = 1e-9);
        assert_relative_eq!(v, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_tangent_offset_directions() {
        // one arcsecond north: +v
        let cen = radec_to_basis(150.0, 2.0);
        let north = radec_to_basis(150.0, 2.0 + 1.0 / 3600.0);
        let (u, v) = tangent_offset(&cen, &north).unwrap();
        assert_relative_eq!(u, 0.0, epsilon = 1e-8);
        assert_relative_eq!(v, 1.0, epsilon = 1e-6);

        // one arcsecond of great circle toward decreasing ra: +u
        let dra = 1.0 / 3600.0 / 2.0_f64.to_radians().cos();
        let west = radec_to_basis(150.0 - dra, 2.0);
        let (u, v) = tangent_offset(&cen, &west).unwrap();
        assert_relative_eq!(u, 1.0, epsilon = 1e-6);
        assert_relative_eq!(v, 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_tangent_offset_behind() {
        let cen = radec_to_basis(0.0, 0.0);
        let opposite = radec_to_basis(180.0, 0.0);
        assert!(tangent_offset(&cen, &opposite).is_none());
    }

    #[test]
    fn test_tan_wcs_roundtrip() {
        let scale = 0.263 / 3600.0;
        let wcs = TanWcs::new(
            (5000.5, 5000.5),
            (36.5, -4.25),
            Matrix2::new(-scale, 0.0, 0.0, scale),
        );
        let (ra, dec) = wcs.image_to_sky(5000.0 - 1.0 + 0.5 - 250.0, 5000.0 - 1.0 + 0.5 + 120.0);
        let (row, col) = wcs.sky_to_image(ra, dec).unwrap().unwrap();
        assert_relative_eq!(row, 4749.5, epsilon = 1e-6);
        assert_relative_eq!(col, 5119.5, epsilon = 1e-6);

        let (ra0, dec0) = wcs.image_to_sky(4999.5, 4999.5);
        assert_relative_eq!(ra0, 36.5, epsilon = 1e-12);
        assert_relative_eq!(dec0, -4.25, epsilon = 1e-12);
    }
}
