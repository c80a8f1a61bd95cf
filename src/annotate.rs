/// Annotated previews: star rects and ids drawn over a stretched image,
/// and the "undetected stars" image with every detected star removed
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect as DrawRect;

use crate::imaging::Image;
use crate::mtf_stretch::{stretch_image, StretchParameters};
use crate::star::Star;
use crate::text_render::{draw_text, text_size};

/// Default annotation colour (opaque green)
pub const DEFAULT_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
/// Gap between a rect and its label
const LABEL_OFFSET: u32 = 4;

/// Per-star drawing style, adjustable by a callback
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationStyle {
    pub color: Rgb<u8>,
    pub pen_width: u32,
    /// Draw the rect
    pub draw: bool,
    /// Draw the label
    pub draw_text: bool,
    /// Label override; the star id when `None`
    pub text: Option<String>,
}

impl Default for AnnotationStyle {
    fn default() -> Self {
        Self {
            color: DEFAULT_COLOR,
            pen_width: 1,
            draw: true,
            draw_text: true,
            text: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnnotateOptions {
    /// Draw enlarged rects instead of plain rects
    pub enlarged: bool,
    /// Display stretch; `None` shows the linear data
    pub stretch: Option<StretchParameters>,
    pub text_scale: u32,
    pub style: AnnotationStyle,
}

impl Default for AnnotateOptions {
    fn default() -> Self {
        Self {
            enlarged: false,
            stretch: Some(StretchParameters::default()),
            text_scale: 1,
            style: AnnotationStyle::default(),
        }
    }
}

fn to_u8(v: f32) -> u8 {
    (v.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// 8-bit RGB rendering of a mono or colour image
pub fn to_rgb(image: &Image) -> RgbImage {
    let mut rgb = RgbImage::new(image.width() as u32, image.height() as u32);
    let color = image.channels() >= 3;
    for (x, y, pixel) in rgb.enumerate_pixels_mut() {
        let (x, y) = (x as usize, y as usize);
        *pixel = if color {
            Rgb([
                to_u8(image.get(x, y, 0)),
                to_u8(image.get(x, y, 1)),
                to_u8(image.get(x, y, 2)),
            ])
        } else {
            let v = to_u8(image.get(x, y, 0));
            Rgb([v, v, v])
        };
    }
    rgb
}

/// Render `image` and draw every star's rect and label.
///
/// `style_fn` may adjust the default style per star, e.g. to colour
/// cohorts differently or to hide some stars.
pub fn annotate_stars(
    image: &Image,
    stars: &[&Star],
    opts: &AnnotateOptions,
    style_fn: Option<&dyn Fn(&Star, &mut AnnotationStyle)>,
) -> RgbImage {
    let display = match &opts.stretch {
        Some(params) => stretch_image(image, params),
        None => image.clone(),
    };
    let mut rgb = to_rgb(&display);
    let (width, height) = (image.width(), image.height());

    let mut drawn = 0usize;
    for star in stars {
        let mut style = opts.style.clone();
        if let Some(f) = style_fn {
            f(star, &mut style);
        }
        if !style.draw {
            continue;
        }
        let r = if opts.enlarged { star.enlarged_rect() } else { star.rect() };
        let Some(b) = r.pixel_bounds(width, height) else {
            continue;
        };

        for inset in 0..style.pen_width.max(1) {
            let w = b.width() as i64 - 2 * inset as i64;
            let h = b.height() as i64 - 2 * inset as i64;
            if w <= 0 || h <= 0 {
                break;
            }
            let outline = DrawRect::at(b.x0 as i32 + inset as i32, b.y0 as i32 + inset as i32)
                .of_size(w as u32, h as u32);
            draw_hollow_rect_mut(&mut rgb, outline, style.color);
        }

        if style.draw_text {
            let label = style.text.as_deref().unwrap_or(star.id());
            let (_, text_h) = text_size(label, opts.text_scale);
            let below = b.y1 as u32 + LABEL_OFFSET;
            // Above the rect when the label would fall off the bottom
            let y = if below + text_h <= height as u32 {
                below
            } else {
                (b.y0 as u32).saturating_sub(LABEL_OFFSET + text_h)
            };
            draw_text(&mut rgb, b.x0 as u32, y, label, style.color, opts.text_scale);
        }
        drawn += 1;
    }
    tracing::debug!("Annotated {} of {} stars", drawn, stars.len());
    rgb
}

/// Copy of `image` with every star rect set to 0 on all channels.
///
/// What is left shows the stars the detector missed.
pub fn undetected_stars(image: &Image, stars: &[&Star], enlarged: bool) -> Image {
    let mut out = image.clone();
    for star in stars {
        let r = if enlarged { star.enlarged_rect() } else { star.rect() };
        let Some(b) = r.pixel_bounds(image.width(), image.height()) else {
            continue;
        };
        for c in 0..out.channels() {
            for y in b.y0..b.y1 {
                for x in b.x0..b.x1 {
                    out.set(x, y, c, 0.0);
                }
            }
        }
    }
    out
}
