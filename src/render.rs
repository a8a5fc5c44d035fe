use image::{Rgb, RgbImage};

use crate::bounds::ValueBounds;
use crate::geo::BoundingBox;
use crate::tree::HeatTile;

/// Color for cells without a known value
pub const UNKNOWN_COLOR: Rgb<u8> = Rgb([0, 0, 255]);

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);

/// Green at 0 %, yellow at 50 %, red at 100 %
pub fn percent_to_color(percent: f64) -> Rgb<u8> {
    let perc = 100.0 - percent.clamp(0.0, 100.0);
    let (r, g) = if perc < 50.0 {
        (255.0, (5.1 * perc).round())
    } else {
        ((510.0 - 5.1 * perc).round(), 255.0)
    };
    Rgb([r as u8, g as u8, 0])
}

pub fn value_color(value: Option<f64>, bounds: Option<ValueBounds>) -> Rgb<u8> {
    match (value, bounds) {
        (Some(value), Some(bounds)) => percent_to_color(bounds.normalize(value) * 100.0),
        (Some(_), None) => percent_to_color(0.0),
        (None, _) => UNKNOWN_COLOR,
    }
}

/// Paint `tiles` into an image covering `viewport`.
///
/// Latitude and longitude map linearly to pixel rows and columns, which is
/// close enough to the map projection at city scale.
pub fn rasterize(
    tiles: &[HeatTile],
    viewport: &BoundingBox,
    bounds: Option<ValueBounds>,
    width: u32,
    height: u32,
) -> RgbImage {
    let mut image = RgbImage::from_pixel(width, height, BACKGROUND);
    if width == 0 || height == 0 || viewport.width() <= 0.0 || viewport.height() <= 0.0 {
        return image;
    }

    let to_column = |lng: f64| (lng - viewport.west()) / viewport.width() * width as f64;
    let to_row = |lat: f64| (viewport.north() - lat) / viewport.height() * height as f64;

    for tile in tiles.iter().filter(|t| viewport.intersects(&t.bounds)) {
        let color = value_color(tile.value, bounds);

        let x0 = to_column(tile.bounds.west()).floor().max(0.0) as u32;
        let x1 = (to_column(tile.bounds.east()).ceil().max(0.0) as u32).min(width);
        let y0 = to_row(tile.bounds.north()).floor().max(0.0) as u32;
        let y1 = (to_row(tile.bounds.south()).ceil().max(0.0) as u32).min(height);

        for y in y0..y1 {
            for x in x0..x1 {
                image.put_pixel(x, y, color);
            }
        }
    }

    image
}
