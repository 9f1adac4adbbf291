//! # Pixel ↔ tangent-plane Jacobian
//!
//! A [`Jacobian`] is the local affine map between a cutout's pixel frame `(row, col)` and a
//! tangent-plane sky frame `(u, v)` expressed in arcseconds:
//!
//! ```text
//! u = dudrow·(row − row0) + dudcol·(col − col0)
//! v = dvdrow·(row − row0) + dvdcol·(col − col0)
//! ```
//!
//! The 2×2 linear part must be invertible. Its absolute determinant is the pixel area in
//! arcsec² (the squared pixel scale) and is what converts fluxes and variances between
//! pixel and sky-calibrated units.

use nalgebra::{Matrix2, Vector2};

use crate::{constants::ArcSec, mofprep_errors::MofError};

#[derive(Debug, Clone, PartialEq)]
pub struct Jacobian {
    row0: f64,
    col0: f64,
    linear: Matrix2<f64>,
    inverse: Matrix2<f64>,
}

impl Jacobian {
    /// Build a Jacobian centered at `(row0, col0)`.
    ///
    /// Arguments
    /// ---------
    /// * `row0`, `col0`: center of the local frame, in pixels
    /// * `dudrow`, `dudcol`, `dvdrow`, `dvdcol`: partial derivatives, in arcsec / pixel
    ///
    /// Return
    /// ------
    /// * The Jacobian, or [`MofError::SingularJacobian`] when the linear part cannot be inverted.
    pub fn new(
        row0: f64,
        col0: f64,
        dudrow: f64,
        dudcol: f64,
        dvdrow: f64,
        dvdcol: f64,
    ) -> Result<Self, MofError> {
        let linear = Matrix2::new(dudrow, dudcol, dvdrow, dvdcol);
        Self::from_matrix(row0, col0, linear)
    }

    /// Build a Jacobian from its center and a full 2×2 linear part.
    pub fn from_matrix(row0: f64, col0: f64, linear: Matrix2<f64>) -> Result<Self, MofError> {
        let det = linear.determinant();
        if det == 0.0 || !det.is_finite() {
            return Err(MofError::SingularJacobian(det));
        }
        let inverse = linear
            .try_inverse()
            .ok_or(MofError::SingularJacobian(det))?;
        Ok(Jacobian {
            row0,
            col0,
            linear,
            inverse,
        })
    }

    /// Identity map centered at the origin.
    ///
    /// Used as the placeholder frame of flagged, zero-size observations.
    pub fn unit() -> Self {
        Jacobian {
            row0: 0.0,
            col0: 0.0,
            linear: Matrix2::identity(),
            inverse: Matrix2::identity(),
        }
    }

    pub fn center(&self) -> (f64, f64) {
        (self.row0, self.col0)
    }

    /// Copy of this Jacobian moved to a new center; the linear part is unchanged.
    pub fn with_center(&self, row0: f64, col0: f64) -> Self {
        Jacobian {
            row0,
            col0,
            ..self.clone()
        }
    }

    pub fn set_center(&mut self, row0: f64, col0: f64) {
        self.row0 = row0;
        self.col0 = col0;
    }

    pub fn linear(&self) -> &Matrix2<f64> {
        &self.linear
    }

    pub fn inverse_linear(&self) -> &Matrix2<f64> {
        &self.inverse
    }

    pub fn dudrow(&self) -> f64 {
        self.linear[(0, 0)]
    }

    pub fn dudcol(&self) -> f64 {
        self.linear[(0, 1)]
    }

    pub fn dvdrow(&self) -> f64 {
        self.linear[(1, 0)]
    }

    pub fn dvdcol(&self) -> f64 {
        self.linear[(1, 1)]
    }

    /// Signed determinant of the linear part.
    pub fn det(&self) -> f64 {
        self.linear.determinant()
    }

    /// Pixel area in arcsec², `|det|`.
    pub fn area(&self) -> f64 {
        self.det().abs()
    }

    /// Pixel scale in arcsec / pixel, `sqrt(|det|)`.
    pub fn scale(&self) -> ArcSec {
        self.area().sqrt()
    }

    /// Tangent-plane offset `(u, v)` of a pixel position relative to the center.
    pub fn pixel_to_uv(&self, row: f64, col: f64) -> (ArcSec, ArcSec) {
        let uv = self.linear * Vector2::new(row - self.row0, col - self.col0);
        (uv.x, uv.y)
    }

    /// Pixel position of a tangent-plane offset `(u, v)` relative to the center.
    pub fn uv_to_pixel(&self, u: ArcSec, v: ArcSec) -> (f64, f64) {
        let rc = self.inverse * Vector2::new(u, v);
        (rc.x + self.row0, rc.y + self.col0)
    }
}
