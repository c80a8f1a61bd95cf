use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned rectangle in image coordinates, `x1`/`y1` exclusive.
///
/// Serialized as `{x, y, width, height}` like the session log expects.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub x0: f64,
    pub y0: f64,
    pub x1: f64,
    pub y1: f64,
}

impl Rect {
    pub fn new(x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        Self { x0, y0, x1, y1 }
    }

    /// Square of side `side` centered on `center`
    pub fn centered_square(center: Point, side: f64) -> Self {
        let left = center.x - side / 2.0;
        let top = center.y - side / 2.0;
        Self::new(left, top, left + side, top + side)
    }

    pub fn width(&self) -> f64 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f64 {
        self.y1 - self.y0
    }

    pub fn area(&self) -> f64 {
        self.width() * self.height()
    }

    pub fn center(&self) -> Point {
        Point::new((self.x0 + self.x1) / 2.0, (self.y0 + self.y1) / 2.0)
    }

    /// Grow by `d` on every side
    pub fn inflated(&self, d: f64) -> Self {
        Self::new(self.x0 - d, self.y0 - d, self.x1 + d, self.y1 + d)
    }

    pub fn includes(&self, x: f64, y: f64) -> bool {
        x >= self.x0 && x < self.x1 && y >= self.y0 && y < self.y1
    }

    pub fn union(&self, other: &Rect) -> Rect {
        Rect::new(
            self.x0.min(other.x0),
            self.y0.min(other.y0),
            self.x1.max(other.x1),
            self.y1.max(other.y1),
        )
    }

    /// Integer pixel bounds clipped to an image of `width` x `height`.
    /// Returns `None` when the rect lies entirely outside.
    pub fn pixel_bounds(&self, width: usize, height: usize) -> Option<PixelRect> {
        let x0 = self.x0.floor().max(0.0) as usize;
        let y0 = self.y0.floor().max(0.0) as usize;
        let x1 = (self.x1.ceil().max(0.0) as usize).min(width);
        let y1 = (self.y1.ceil().max(0.0) as usize).min(height);
        if x0 >= x1 || y0 >= y1 {
            return None;
        }
        Some(PixelRect { x0, y0, x1, y1 })
    }
}

#[derive(Serialize, Deserialize)]
struct RectRepr {
    x: f64,
    y: f64,
    width: f64,
    height: f64,
}

impl Serialize for Rect {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        RectRepr {
            x: self.x0,
            y: self.y0,
            width: self.width(),
            height: self.height(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Rect {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let r = RectRepr::deserialize(deserializer)?;
        Ok(Rect::new(r.x, r.y, r.x + r.width, r.y + r.height))
    }
}

/// Clipped integer pixel rectangle, `x1`/`y1` exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x0: usize,
    pub y0: usize,
    pub x1: usize,
    pub y1: usize,
}

impl PixelRect {
    pub fn width(&self) -> usize {
        self.x1 - self.x0
    }

    pub fn height(&self) -> usize {
        self.y1 - self.y0
    }

    /// Grow by `margin` pixels, clipped to the image
    pub fn expanded(&self, margin: usize, width: usize, height: usize) -> PixelRect {
        PixelRect {
            x0: self.x0.saturating_sub(margin),
            y0: self.y0.saturating_sub(margin),
            x1: (self.x1 + margin).min(width),
            y1: (self.y1 + margin).min(height),
        }
    }

    pub fn union(&self, other: &PixelRect) -> PixelRect {
        PixelRect {
            x0: self.x0.min(other.x0),
            y0: self.y0.min(other.y0),
            x1: self.x1.max(other.x1),
            y1: self.y1.max(other.y1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_centered_square() {
        let r = Rect::centered_square(Point::new(10.0, 20.0), 4.0);
        assert_eq!(r, Rect::new(8.0, 18.0, 12.0, 22.0));
        assert_eq!(r.width(), 4.0);
        assert_eq!(r.center(), Point::new(10.0, 20.0));
    }

    #[test]
    fn test_inflated_and_includes() {
        let r = Rect::new(0.0, 0.0, 2.0, 2.0).inflated(1.0);
        assert_eq!(r.width(), 4.0);
        assert!(r.includes(-1.0, -1.0));
        assert!(!r.includes(3.0, 0.0));
    }

    #[test]
    fn test_pixel_bounds_clipping() {
        let r = Rect::new(-3.5, 2.2, 5.1, 40.0);
        let p = r.pixel_bounds(10, 10).unwrap();
        assert_eq!(p, PixelRect { x0: 0, y0: 2, x1: 6, y1: 10 });
        assert!(Rect::new(20.0, 20.0, 25.0, 25.0).pixel_bounds(10, 10).is_none());
        assert_eq!(p.expanded(3, 10, 10), PixelRect { x0: 0, y0: 0, x1: 9, y1: 10 });
    }

    #[test]
    fn test_rect_serialization() {
        let r = Rect::new(1.0, 2.0, 4.0, 8.0);
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, r#"{"x":1.0,"y":2.0,"width":3.0,"height":6.0}"#);
        let back: Rect = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }
}
