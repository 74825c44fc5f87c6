//! Rectangle and region math used throughout the scene graph and renderer.

use glam::{DVec2, IVec2};

/// An integer rectangle in some pixel coordinate space.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Rect {
    pub pos: IVec2,
    pub size: IVec2,
}

impl Rect {
    pub const fn from_xywh(x: i32, y: i32, w: i32, h: i32) -> Self {
        Self {
            pos: IVec2::new(x, y),
            size: IVec2::new(w, h),
        }
    }

    pub fn from_pos_size(pos: impl Into<IVec2>, size: impl Into<IVec2>) -> Self {
        Self {
            pos: pos.into(),
            size: size.into(),
        }
    }

    pub fn from_min_max(min: impl Into<IVec2>, max: impl Into<IVec2>) -> Self {
        let (min, max) = (min.into(), max.into());
        Self {
            pos: min,
            size: max - min,
        }
    }

    pub fn min(&self) -> IVec2 {
        self.pos
    }

    pub fn max(&self) -> IVec2 {
        self.pos + self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size.x <= 0 || self.size.y <= 0
    }

    pub fn contains(&self, point: impl Into<IVec2>) -> bool {
        let p = point.into();
        let max = self.max();
        p.x >= self.pos.x && p.y >= self.pos.y && p.x < max.x && p.y < max.y
    }

    pub fn intersect(&self, other: Rect) -> Rect {
        let min = self.min().max(other.min());
        let max = self.max().min(other.max());
        if max.x <= min.x || max.y <= min.y {
            Rect::default()
        } else {
            Rect::from_min_max(min, max)
        }
    }

    pub fn translate(&self, delta: impl Into<IVec2>) -> Rect {
        Rect {
            pos: self.pos + delta.into(),
            size: self.size,
        }
    }

    pub fn as_frect(&self) -> FRect {
        FRect {
            pos: self.pos.as_dvec2(),
            size: self.size.as_dvec2(),
        }
    }
}

/// A double-precision rectangle, used for global layout coordinates.
#[derive(Debug, Default, Copy, Clone, PartialEq)]
pub struct FRect {
    pub pos: DVec2,
    pub size: DVec2,
}

impl FRect {
    pub fn from_xywh(x: f64, y: f64, w: f64, h: f64) -> Self {
        Self {
            pos: DVec2::new(x, y),
            size: DVec2::new(w, h),
        }
    }

    pub fn from_pos_size(pos: impl Into<DVec2>, size: impl Into<DVec2>) -> Self {
        Self {
            pos: pos.into(),
            size: size.into(),
        }
    }

    pub fn from_min_max(min: impl Into<DVec2>, max: impl Into<DVec2>) -> Self {
        let (min, max) = (min.into(), max.into());
        Self {
            pos: min,
            size: max - min,
        }
    }

    pub fn min(&self) -> DVec2 {
        self.pos
    }

    pub fn max(&self) -> DVec2 {
        self.pos + self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size.x <= 0.0 || self.size.y <= 0.0
    }

    pub fn contains(&self, point: impl Into<DVec2>) -> bool {
        let p = point.into();
        let max = self.max();
        p.x >= self.pos.x && p.y >= self.pos.y && p.x < max.x && p.y < max.y
    }

    pub fn translate(&self, delta: impl Into<DVec2>) -> FRect {
        FRect {
            pos: self.pos + delta.into(),
            size: self.size,
        }
    }

    pub fn scale(&self, factor: impl Into<DVec2>) -> FRect {
        let factor = factor.into();
        FRect {
            pos: self.pos * factor,
            size: self.size * factor,
        }
    }

    pub fn center(&self) -> DVec2 {
        self.pos + self.size * 0.5
    }

    /// Clamps a point to lie within the rect (inclusive of the far edge).
    pub fn clamp_point(&self, point: impl Into<DVec2>) -> DVec2 {
        point.into().clamp(self.min(), self.max())
    }

    /// The largest centered sub-rect of `inner` matching the aspect ratio of
    /// `outer`. Used to crop a background image to an output.
    pub fn fit(inner: impl Into<DVec2>, outer: impl Into<DVec2>) -> FRect {
        let (inner, outer) = (inner.into(), outer.into());
        if inner.x <= 0.0 || inner.y <= 0.0 || outer.x <= 0.0 || outer.y <= 0.0 {
            return FRect::default();
        }

        let scale = (inner.x / outer.x).min(inner.y / outer.y);
        let size = outer * scale;
        FRect {
            pos: (inner - size) * 0.5,
            size,
        }
    }
}

/// A region built from a sequence of added and subtracted rectangles.
///
/// Only point queries are needed (input regions, constraint regions), so the
/// op list is kept verbatim and replayed per query instead of being
/// normalized into bands.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Region {
    ops: Vec<(RegionOp, Rect)>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum RegionOp {
    Add,
    Subtract,
}

impl Region {
    /// The all-encompassing region. An empty op list would be the empty
    /// region, so infinite is modeled explicitly.
    pub fn infinite() -> Self {
        Self {
            ops: vec![(
                RegionOp::Add,
                Rect::from_xywh(i32::MIN / 2, i32::MIN / 2, i32::MAX, i32::MAX),
            )],
        }
    }

    pub fn add(&mut self, rect: Rect) {
        self.ops.push((RegionOp::Add, rect));
    }

    pub fn subtract(&mut self, rect: Rect) {
        self.ops.push((RegionOp::Subtract, rect));
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn contains(&self, point: impl Into<IVec2>) -> bool {
        let p = point.into();
        let mut inside = false;
        for (op, rect) in &self.ops {
            match op {
                RegionOp::Add => inside = inside || rect.contains(p),
                RegionOp::Subtract => inside = inside && !rect.contains(p),
            }
        }

        inside
    }

    /// Clamps a point into the region by snapping to the nearest contained
    /// integer position among the added rects. Falls back to the input when
    /// the region accepts nothing.
    pub fn clamp_point(&self, point: impl Into<DVec2>) -> DVec2 {
        let p = point.into();
        if self.contains(p.round().as_ivec2()) {
            return p;
        }

        let mut best: Option<(f64, DVec2)> = None;
        for (op, rect) in &self.ops {
            if *op != RegionOp::Add || rect.is_empty() {
                continue;
            }

            let min = rect.min().as_dvec2();
            // The far edge is exclusive for integer point containment.
            let max = rect.max().as_dvec2() - DVec2::ONE;
            let candidate = p.clamp(min, min.max(max));
            let dist = candidate.distance_squared(p);
            if best.map_or(true, |(d, _)| dist < d) {
                best = Some((dist, candidate));
            }
        }

        best.map(|(_, p)| p).unwrap_or(p)
    }
}

/// A one-dimensional slice of a rect, as used by the popup placement
/// algorithm, which operates on each axis independently.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct AxisRegion {
    pub pos: i32,
    pub size: i32,
}

impl AxisRegion {
    pub fn new(pos: i32, size: i32) -> Self {
        Self { pos, size }
    }

    pub fn end(&self) -> i32 {
        self.pos + self.size
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn rect_intersect() {
        let a = Rect::from_xywh(0, 0, 100, 100);
        let b = Rect::from_xywh(50, 60, 100, 100);
        assert_eq!(a.intersect(b), Rect::from_xywh(50, 60, 50, 40));

        let c = Rect::from_xywh(200, 200, 10, 10);
        assert!(a.intersect(c).is_empty());
    }

    #[test]
    fn rect_contains_excludes_far_edge() {
        let r = Rect::from_xywh(10, 10, 5, 5);
        assert!(r.contains((10, 10)));
        assert!(r.contains((14, 14)));
        assert!(!r.contains((15, 14)));
        assert!(!r.contains((9, 10)));
    }

    #[test]
    fn region_add_subtract() {
        let mut region = Region::default();
        region.add(Rect::from_xywh(0, 0, 100, 100));
        region.subtract(Rect::from_xywh(25, 25, 50, 50));
        region.add(Rect::from_xywh(40, 40, 10, 10));

        assert!(region.contains((5, 5)));
        assert!(!region.contains((30, 30)));
        assert!(region.contains((45, 45)));
        assert!(!region.contains((120, 5)));
    }

    #[test]
    fn region_clamp() {
        let mut region = Region::default();
        region.add(Rect::from_xywh(0, 0, 10, 10));

        assert_eq!(region.clamp_point(DVec2::new(4.0, 4.0)), DVec2::new(4.0, 4.0));
        assert_eq!(region.clamp_point(DVec2::new(20.0, 5.0)), DVec2::new(9.0, 5.0));
        assert_eq!(region.clamp_point(DVec2::new(-3.0, -3.0)), DVec2::ZERO);
    }

    #[test]
    fn fit_crops_to_aspect() {
        // A 200x100 image shown on a square output crops the sides.
        let src = FRect::fit((200.0, 100.0), (100.0, 100.0));
        assert_eq!(src, FRect::from_xywh(50.0, 0.0, 100.0, 100.0));
    }
}
