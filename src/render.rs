//! Equirectangular to perspective projection.
//!
//! Pure function of (panorama, heading, pitch, fov, output size); identical
//! inputs produce identical JPEG bytes. Heading 0 is true north and increases
//! clockwise, pitch is positive looking up. `center_heading` is the true-north
//! heading of the panorama's centre column, so all viewer-space offsets are
//! already resolved by the time an image reaches this module.

use image::{Rgb, RgbImage};

use crate::math::normalize_heading;

/// Fixed encode quality; rendering must be reproducible across calls.
const JPEG_QUALITY: u8 = 85;

#[derive(Debug, Clone, Copy)]
pub struct ViewParams {
    pub heading: f64,
    pub pitch: f64,
    pub fov: f64,
    pub width: u32,
    pub height: u32,
}

pub const PITCH_MIN: f64 = -85.;
pub const PITCH_MAX: f64 = 85.;
pub const FOV_MIN: f64 = 30.;
pub const FOV_MAX: f64 = 100.;

pub fn render_perspective(
    pano: &RgbImage,
    center_heading: f64,
    view: &ViewParams,
) -> eyre::Result<Vec<u8>> {
    let (pw, ph) = pano.dimensions();
    eyre::ensure!(pw >= 2 && ph >= 2, "panorama too small: {pw}x{ph}");
    eyre::ensure!(view.width > 0 && view.height > 0, "empty output size");

    let tan_half_h = (view.fov.to_radians() / 2.).tan();
    let tan_half_v = tan_half_h * view.height as f64 / view.width as f64;

    let (pitch_sin, pitch_cos) = view.pitch.to_radians().sin_cos();
    let (heading_sin, heading_cos) = view.heading.to_radians().sin_cos();

    let mut out = RgbImage::new(view.width, view.height);

    for j in 0..view.height {
        // camera-space y, +1 at the top of the frame
        let cy = (1. - 2. * (j as f64 + 0.5) / view.height as f64) * tan_half_v;

        for i in 0..view.width {
            let cx = (2. * (i as f64 + 0.5) / view.width as f64 - 1.) * tan_half_h;

            // pitch about the camera's x axis, then yaw about the world's
            // vertical; world axes are X=east, Y=up, Z=north
            let y1 = cy * pitch_cos + pitch_sin;
            let z1 = pitch_cos - cy * pitch_sin;
            let wx = cx * heading_cos + z1 * heading_sin;
            let wz = -cx * heading_sin + z1 * heading_cos;
            let wy = y1;

            let ray_heading = wx.atan2(wz).to_degrees();
            let elevation = wy.atan2((wx * wx + wz * wz).sqrt()).to_degrees();

            // centre column of the panorama is center_heading
            let offset = normalize_heading(ray_heading - center_heading);
            let sx = (offset / 360. + 0.5) * pw as f64;
            let sy = (90. - elevation) / 180. * ph as f64;

            out.put_pixel(i, j, sample_bilinear(pano, sx, sy));
        }
    }

    let mut jpeg = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY)
        .encode_image(&out)?;
    Ok(jpeg)
}

/// Bilinear sample with horizontal wrap and vertical clamp.
fn sample_bilinear(img: &RgbImage, x: f64, y: f64) -> Rgb<u8> {
    let (w, h) = img.dimensions();

    let xf = x - 0.5;
    let yf = (y - 0.5).clamp(0., (h - 1) as f64);

    let x0 = xf.floor();
    let y0 = yf.floor();
    let tx = xf - x0;
    let ty = yf - y0;

    let x0i = (x0.rem_euclid(w as f64)) as u32 % w;
    let x1i = (x0i + 1) % w;
    let y0i = y0 as u32;
    let y1i = (y0i + 1).min(h - 1);

    let p00 = img.get_pixel(x0i, y0i);
    let p10 = img.get_pixel(x1i, y0i);
    let p01 = img.get_pixel(x0i, y1i);
    let p11 = img.get_pixel(x1i, y1i);

    let mut px = [0u8; 3];
    for c in 0..3 {
        let top = p00[c] as f64 * (1. - tx) + p10[c] as f64 * tx;
        let bottom = p01[c] as f64 * (1. - tx) + p11[c] as f64 * tx;
        px[c] = (top * (1. - ty) + bottom * ty).round() as u8;
    }
    Rgb(px)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RED: Rgb<u8> = Rgb([220, 20, 20]);
    const GREEN: Rgb<u8> = Rgb([20, 220, 20]);
    const BLUE: Rgb<u8> = Rgb([20, 20, 220]);
    const YELLOW: Rgb<u8> = Rgb([220, 220, 20]);

    /// A 512x256 panorama whose columns are painted by the true-north heading
    /// they represent: north=red, east=green, south=blue, west=yellow.
    fn quadrant_pano(center_heading: f64) -> RgbImage {
        let (w, h) = (512u32, 256u32);
        let mut img = RgbImage::new(w, h);
        for x in 0..w {
            let offset = x as f64 / w as f64 * 360. - 180.;
            let heading = normalize_heading(center_heading + offset);
            let color = match heading {
                h if !(45. ..315.).contains(&h) => RED,
                h if h < 135. => GREEN,
                h if h < 225. => BLUE,
                _ => YELLOW,
            };
            for y in 0..h {
                img.put_pixel(x, y, color);
            }
        }
        img
    }

    fn view(heading: f64, pitch: f64) -> ViewParams {
        ViewParams {
            heading,
            pitch,
            fov: 60.,
            width: 64,
            height: 48,
        }
    }

    fn center_pixel(jpeg: &[u8]) -> Rgb<u8> {
        let img = image::load_from_memory(jpeg).unwrap().to_rgb8();
        *img.get_pixel(img.width() / 2, img.height() / 2)
    }

    fn roughly(a: Rgb<u8>, b: Rgb<u8>) -> bool {
        a.0.iter().zip(b.0).all(|(&x, y)| x.abs_diff(y) < 60)
    }

    #[test]
    fn test_render_is_deterministic() {
        let pano = quadrant_pano(0.);
        let v = view(123.4, -20.);
        let a = render_perspective(&pano, 0., &v).unwrap();
        let b = render_perspective(&pano, 0., &v).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_output_dimensions() {
        let pano = quadrant_pano(0.);
        let jpeg = render_perspective(&pano, 0., &view(0., 0.)).unwrap();
        let img = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(img.width(), 64);
        assert_eq!(img.height(), 48);
    }

    #[test]
    fn test_cardinal_headings_face_the_right_quadrant() {
        let pano = quadrant_pano(0.);
        for (heading, expected) in [(0., RED), (90., GREEN), (180., BLUE), (270., YELLOW)] {
            let jpeg = render_perspective(&pano, 0., &view(heading, 0.)).unwrap();
            let px = center_pixel(&jpeg);
            assert!(
                roughly(px, expected),
                "heading {heading}: got {px:?}, expected {expected:?}"
            );
        }
    }

    #[test]
    fn test_center_heading_shifts_the_panorama() {
        // same quadrant layout, but the image's centre column now faces east
        let pano = quadrant_pano(90.);
        let jpeg = render_perspective(&pano, 90., &view(0., 0.)).unwrap();
        assert!(roughly(center_pixel(&jpeg), RED));

        let jpeg = render_perspective(&pano, 90., &view(90., 0.)).unwrap();
        assert!(roughly(center_pixel(&jpeg), GREEN));
    }

    #[test]
    fn test_pitch_moves_toward_poles() {
        let (w, h) = (512u32, 256u32);
        let mut pano = RgbImage::new(w, h);
        for y in 0..h {
            let color = if y < h / 2 { Rgb([255, 255, 255]) } else { Rgb([0, 0, 0]) };
            for x in 0..w {
                pano.put_pixel(x, y, color);
            }
        }

        let up = render_perspective(&pano, 0., &view(0., PITCH_MAX)).unwrap();
        assert!(roughly(center_pixel(&up), Rgb([255, 255, 255])));

        let down = render_perspective(&pano, 0., &view(0., PITCH_MIN)).unwrap();
        assert!(roughly(center_pixel(&down), Rgb([0, 0, 0])));
    }

    #[test]
    fn test_fov_bounds_render() {
        let pano = quadrant_pano(0.);
        for fov in [FOV_MIN, FOV_MAX] {
            let v = ViewParams {
                heading: 0.,
                pitch: 0.,
                fov,
                width: 32,
                height: 24,
            };
            let jpeg = render_perspective(&pano, 0., &v).unwrap();
            assert!(roughly(center_pixel(&jpeg), RED), "fov {fov}");
        }
    }

    #[test]
    fn test_heading_wrap_near_360() {
        let pano = quadrant_pano(0.);
        let jpeg = render_perspective(&pano, 0., &view(359.99, 0.)).unwrap();
        assert!(roughly(center_pixel(&jpeg), RED));
    }
}
