#![allow(dead_code)]

use std::sync::Arc;

use mofprep::{
    constants::{Image, IntImage, ObjectId, ObjectNumber},
    cutouts::{
        memory::{EpochPixels, MemoryCutouts, MemoryEpoch},
        CutoutSource, EpochInfo, ImageInfo, ObjectInfo,
    },
    jacobian::Jacobian,
    sphere::{TanWcs, WcsCatalog},
};
use nalgebra::Matrix2;

pub const SCALE: f64 = 0.263;
pub const BOX_SIZE: usize = 15;
/// Center of every cutout, in cutout pixels
pub const CEN: f64 = 7.0;

pub fn jacobian(row0: f64, col0: f64) -> Jacobian {
    Jacobian::new(row0, col0, 0.0, SCALE, SCALE, 0.0).unwrap()
}

/// Image table of a band: the coadd followed by `nepoch` single-epoch images.
pub fn image_table(band: usize, nepoch: usize) -> Vec<ImageInfo> {
    std::iter::once(ImageInfo {
        image_path: format!("/data/coadd/DES0001-0001_{band}.fits"),
        image_id: 1000 * band as i64,
        image_flags: 0,
    })
    .chain((1..=nepoch).map(|i| ImageInfo {
        image_path: format!("/data/red/D00{}_{}_{:02}_immasked.fits", 232320 + i, 232320 + i, i),
        image_id: 1000 * band as i64 + i as i64,
        image_flags: 0,
    }))
    .collect()
}

/// Segmentation map of a cutout: the object's number on the central 3×3 pixels.
pub fn seg_map(number: ObjectNumber) -> IntImage {
    IntImage::from_fn(BOX_SIZE, BOX_SIZE, |r, c| {
        let near = (r as f64 - CEN).abs() <= 1.0 && (c as f64 - CEN).abs() <= 1.0;
        if near {
            number as i32
        } else {
            0
        }
    })
}

/// A cutout of image `file_id` centered on mosaic position `orig`.
pub fn epoch(file_id: usize, orig: (f64, f64), number: ObjectNumber) -> MemoryEpoch {
    MemoryEpoch {
        info: EpochInfo {
            file_id,
            orig_row: orig.0,
            orig_col: orig.1,
            orig_start_row: orig.0 - CEN,
            orig_start_col: orig.1 - CEN,
            jacobian: jacobian(CEN, CEN),
        },
        pixels: Some(EpochPixels::new(
            Image::from_element(BOX_SIZE, BOX_SIZE, 10.0),
            Image::from_element(BOX_SIZE, BOX_SIZE, 1.0),
            seg_map(number),
        )),
    }
}

pub fn object_info(id: ObjectId, number: ObjectNumber, ncutout: usize) -> ObjectInfo {
    ObjectInfo {
        id,
        number,
        ncutout,
        box_size: BOX_SIZE,
    }
}

/// A band holding the given objects, each as `(id, number, cutouts)`.
pub fn band(
    band: usize,
    nepoch: usize,
    objects: Vec<(ObjectId, ObjectNumber, Vec<MemoryEpoch>)>,
) -> MemoryCutouts {
    let mut cutouts = MemoryCutouts::new(image_table(band, nepoch));
    for (id, number, epochs) in objects {
        cutouts.push_object(object_info(id, number, epochs.len()), epochs);
    }
    cutouts
}

pub fn sources(bands: Vec<MemoryCutouts>) -> Vec<Arc<dyn CutoutSource>> {
    bands
        .into_iter()
        .map(|b| Arc::new(b) as Arc<dyn CutoutSource>)
        .collect()
}

/// TAN WCS of the coadd of every band, north up and east left.
pub fn coadd_wcs(nband: usize) -> WcsCatalog {
    let s = SCALE / 3600.0;
    let mut catalog = WcsCatalog::new();
    for band in 0..nband {
        catalog.insert(
            band,
            0,
            TanWcs::new(
                (5000.5, 5000.5),
                (21.5, -1.25),
                Matrix2::new(-s, 0.0, 0.0, s),
            ),
        );
    }
    catalog
}
