//! # Observation model
//!
//! The in-memory model handed to the fitter:
//!
//! * [`Observation`] – one cutout (one epoch of one band) with its weights, segmentation,
//!   Jacobian, PSF and meta-data,
//! * [`ObsList`] – the observations of one object in one band,
//! * [`MultiBandObsList`] – one [`ObsList`] per band plus object-level meta-data.
//!
//! Every object produces two [`MultiBandObsList`]s: the *reference* view (the coadd cutout,
//! slot 0, of every band) and the *single-epoch* view (slots 1.. of every band).

pub mod meta;

use crate::{
    constants::{FileId, GroupId, Image, IntImage, ObjectId, ObjectNumber, RowIndex},
    cutouts::PsfStamp,
    jacobian::Jacobian,
};

use self::meta::{EpochMeta, ObjectMeta};

/// PSF of an observation, in the observation's sky frame.
#[derive(Debug, Clone, PartialEq)]
pub struct PsfObservation {
    pub image: Image,
    /// Image Jacobian re-centered on the PSF center
    pub jacobian: Jacobian,
    /// PSF width in arcseconds
    pub sigma_sky: f64,
    /// Starting guess for the PSF second moment `T`, `sigma_sky²`
    pub t_guess: f64,
    /// Sum of the PSF pixels
    pub psf_norm: f64,
    pub label: String,
}

impl PsfObservation {
    /// Attach a PSF stamp to the frame of the image it belongs to.
    ///
    /// Arguments
    /// ---------
    /// * `stamp`: the PSF image, its center and width in pixels
    /// * `image_jacobian`: Jacobian of the cutout; its linear part is reused at the PSF center
    pub fn from_stamp(stamp: PsfStamp, image_jacobian: &Jacobian) -> Self {
        let jacobian = image_jacobian.with_center(stamp.center.0, stamp.center.1);
        let sigma_sky = stamp.sigma_pix * jacobian.scale();
        let psf_norm = stamp.image.sum();
        PsfObservation {
            image: stamp.image,
            jacobian,
            sigma_sky,
            t_guess: sigma_sky * sigma_sky,
            psf_norm,
            label: stamp.label,
        }
    }
}

/// PSF and frame of every neighbor, as seen from one observation of a central object.
///
/// The three vectors are indexed in neighbor order (see [`MultiBandObsList::nbrs_inds`]).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NeighborGeometry {
    pub psfs: Vec<Option<PsfObservation>>,
    pub jacobians: Vec<Option<Jacobian>>,
    pub flags: Vec<i32>,
}

impl NeighborGeometry {
    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    pub fn push(&mut self, psf: Option<PsfObservation>, jacobian: Option<Jacobian>, flag: i32) {
        self.psfs.push(psf);
        self.jacobians.push(jacobian);
        self.flags.push(flag);
    }
}

/// One cutout of one object in one band.
///
/// A *flagged* observation (non-zero [`flags`](Self::flags)) has empty 0×0 pixel grids; its
/// positional meta-data is filled nonetheless, unless the epoch info itself could not be
/// read (see [`has_epoch_info`](Self::has_epoch_info)).
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub image: Image,
    pub weight: Image,
    /// Copy of the weight before outlier rejection
    pub weight_raw: Image,
    /// Unsmoothed weight variant, depending on the weight policy
    pub weight_us: Option<Image>,
    /// Snapshots taken before neighbor geometry is attached
    pub image_orig: Option<Image>,
    pub weight_orig: Option<Image>,
    pub seg: IntImage,
    /// Bad-pixel mask, only read when mask propagation or halo flagging is enabled
    pub bmask: Option<IntImage>,
    pub jacobian: Jacobian,
    pub psf: Option<PsfObservation>,
    pub flags: i64,
    /// Cutout slot, 0 = reference
    pub icut: usize,
    /// Set once the positional meta-data below has been read from the cutout source
    pub has_epoch_info: bool,
    pub file_id: FileId,
    pub orig_row: f64,
    pub orig_col: f64,
    pub orig_start_row: f64,
    pub orig_start_col: f64,
    pub filename: String,
    pub meta: EpochMeta,
    pub nbrs: Option<NeighborGeometry>,
}

impl Observation {
    /// An empty observation carrying only the given status flags.
    pub fn flagged(icut: usize, flags: i64) -> Self {
        Observation {
            image: Image::zeros(0, 0),
            weight: Image::zeros(0, 0),
            weight_raw: Image::zeros(0, 0),
            weight_us: None,
            image_orig: None,
            weight_orig: None,
            seg: IntImage::zeros(0, 0),
            bmask: None,
            jacobian: Jacobian::unit(),
            psf: None,
            flags,
            icut,
            has_epoch_info: false,
            file_id: 0,
            orig_row: 0.0,
            orig_col: 0.0,
            orig_start_row: 0.0,
            orig_start_col: 0.0,
            filename: String::new(),
            meta: EpochMeta::default(),
            nbrs: None,
        }
    }

    #[inline]
    pub fn is_good(&self) -> bool {
        self.flags == 0
    }

    /// `(nrows, ncols)` of the pixel grid.
    pub fn shape(&self) -> (usize, usize) {
        self.image.shape()
    }

    /// Store copies of the current image and weight in `image_orig` / `weight_orig`.
    pub fn snapshot(&mut self) {
        self.image_orig = Some(self.image.clone());
        self.weight_orig = Some(self.weight.clone());
    }

    /// Set every weight variant to zero where `mask(row, col)` is true.
    ///
    /// Return
    /// ------
    /// * the number of pixels masked
    pub fn zero_weights_where(&mut self, mask: impl Fn(usize, usize) -> bool) -> usize {
        let (nrows, ncols) = self.weight.shape();
        let mut count = 0;
        for col in 0..ncols {
            for row in 0..nrows {
                if !mask(row, col) {
                    continue;
                }
                count += 1;
                self.weight[(row, col)] = 0.0;
                for grid in [
                    Some(&mut self.weight_raw),
                    self.weight_us.as_mut(),
                    self.weight_orig.as_mut(),
                ]
                .into_iter()
                .flatten()
                {
                    if grid.shape() == (nrows, ncols) {
                        grid[(row, col)] = 0.0;
                    }
                }
            }
        }
        count
    }
}

pub type ObsList = Vec<Observation>;

/// The observations of one object in every band, and the object-level meta-data.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiBandObsList {
    pub bands: Vec<ObsList>,
    pub id: ObjectId,
    pub number: ObjectNumber,
    /// Row of the object in the band catalogs
    pub row: RowIndex,
    /// Bitwise OR of the object-level flags
    pub obj_flags: i64,
    pub meta: ObjectMeta,
    /// Position of this object within its group, when neighbors are modeled
    pub cen_ind: Option<usize>,
    /// Positions of the neighbors within the group
    pub nbrs_inds: Vec<usize>,
    pub nbrs_ids: Vec<ObjectId>,
}

impl MultiBandObsList {
    pub fn new(id: ObjectId, number: ObjectNumber, row: RowIndex, nband: usize) -> Self {
        let mut meta = ObjectMeta::new(nband);
        meta.id = id;
        meta.number = number;
        MultiBandObsList {
            bands: Vec::with_capacity(nband),
            id,
            number,
            row,
            obj_flags: 0,
            meta,
            cen_ind: None,
            nbrs_inds: Vec::new(),
            nbrs_ids: Vec::new(),
        }
    }

    pub fn nband(&self) -> usize {
        self.bands.len()
    }

    pub fn fofid(&self) -> GroupId {
        self.meta.fofid
    }

    pub fn set_fofid(&mut self, fofid: GroupId) {
        self.meta.fofid = fofid;
    }

    /// Every observation, with its band index.
    pub fn iter_obs(&self) -> impl Iterator<Item = (usize, &Observation)> {
        self.bands
            .iter()
            .enumerate()
            .flat_map(|(band, list)| list.iter().map(move |obs| (band, obs)))
    }

    pub fn iter_obs_mut(&mut self) -> impl Iterator<Item = &mut Observation> {
        self.bands.iter_mut().flatten()
    }

    /// Every good observation, with its band index.
    pub fn good_obs(&self) -> impl Iterator<Item = (usize, &Observation)> {
        self.iter_obs().filter(|(_, obs)| obs.is_good())
    }
}
