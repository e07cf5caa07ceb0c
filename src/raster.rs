//! Item Vault - Raster Operations
//!
//! Resizing, pool composition and codec round-trips on top of the `image`
//! crate. Pools are plain RGBA rasters of `columns x rows` slots; slot `index`
//! sits at pixel offset `(column * width, row * height)`.

use std::io::Cursor;

use image::{imageops, imageops::FilterType, DynamicImage, RgbaImage};

use crate::cache::ImageHandle;
use crate::crypto::{ImageFormatSpec, IMAGE_FORMAT, THUMBNAIL_FORMAT};
use crate::error::{VaultError, VaultResult};
use crate::model::ImageSize;
use crate::pool::PoolGeometry;

/// An imported image, resized for both roles
#[derive(Debug, Clone)]
pub struct LoadedImage {
    /// Full image, encoded in [`IMAGE_FORMAT`]
    pub image: ImageHandle,
    /// Thumbnail raster, ready to be placed into a pool
    pub thumbnail: RgbaImage,
    /// Thumbnail encoded in [`THUMBNAIL_FORMAT`]
    pub thumbnail_handle: ImageHandle,
}

pub fn to_thumbnail_size(size: ImageSize, downscale: u32) -> ImageSize {
    ImageSize {
        width: size.width / downscale,
        height: size.height / downscale,
    }
}

/// Pixel offset of a slot inside its pool
pub fn slot_offset(index: u32, slot: ImageSize, geometry: PoolGeometry) -> (u32, u32) {
    let (row, column) = geometry.locate(index);
    (column as u32 * slot.width, row as u32 * slot.height)
}

/// Fully transparent pool raster
pub fn create_empty_pool(slot: ImageSize, geometry: PoolGeometry) -> RgbaImage {
    RgbaImage::new(
        slot.width * geometry.columns as u32,
        slot.height * geometry.rows as u32,
    )
}

/// Copy `source` over one slot; pixels outside the slot are untouched
pub fn place_into_pool(
    pool: &mut RgbaImage,
    index: u32,
    source: &RgbaImage,
    slot: ImageSize,
    geometry: PoolGeometry,
) {
    let (x, y) = slot_offset(index, slot, geometry);
    if source.width() > slot.width || source.height() > slot.height {
        let clipped = imageops::crop_imm(source, 0, 0, slot.width, slot.height).to_image();
        imageops::replace(pool, &clipped, i64::from(x), i64::from(y));
    } else {
        imageops::replace(pool, source, i64::from(x), i64::from(y));
    }
}

pub fn crop_slot(
    pool: &RgbaImage,
    index: u32,
    slot: ImageSize,
    geometry: PoolGeometry,
) -> RgbaImage {
    let (x, y) = slot_offset(index, slot, geometry);
    imageops::crop_imm(pool, x, y, slot.width, slot.height).to_image()
}

pub fn encode_image(raster: &RgbaImage, format: &ImageFormatSpec) -> VaultResult<Vec<u8>> {
    let mut output = Vec::new();
    raster.write_to(&mut Cursor::new(&mut output), format.codec)?;
    Ok(output)
}

pub fn decode_image(bytes: &[u8]) -> VaultResult<RgbaImage> {
    Ok(image::load_from_memory(bytes)?.to_rgba8())
}

/// Decode arbitrary image bytes into the full image and its thumbnail
pub fn load_image(bytes: &[u8], image_size: ImageSize, downscale: u32) -> VaultResult<LoadedImage> {
    let thumbnail_size = to_thumbnail_size(image_size, downscale);
    if thumbnail_size.width == 0 || thumbnail_size.height == 0 {
        return Err(VaultError::ImageCodec(format!(
            "image size {}x{} leaves no room for a thumbnail",
            image_size.width, image_size.height
        )));
    }

    let source: DynamicImage = image::load_from_memory(bytes)?;

    let full = source
        .resize_exact(image_size.width, image_size.height, FilterType::Lanczos3)
        .to_rgba8();
    let thumbnail = source
        .resize_exact(thumbnail_size.width, thumbnail_size.height, FilterType::Lanczos3)
        .to_rgba8();

    Ok(LoadedImage {
        image: ImageHandle::new(encode_image(&full, &IMAGE_FORMAT)?, IMAGE_FORMAT.mime),
        thumbnail_handle: ImageHandle::new(
            encode_image(&thumbnail, &THUMBNAIL_FORMAT)?,
            THUMBNAIL_FORMAT.mime,
        ),
        thumbnail,
    })
}
