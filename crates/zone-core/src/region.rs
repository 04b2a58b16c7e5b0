//! Polygonal counting region and the point-in-polygon test.
//!
//! A [`Region`] is validated once at construction and never mutated afterwards.
//! Membership uses the crossing-number rule with an explicit boundary check in
//! front of it, so a point lying on an edge is always classified as inside.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Distance (in pixels) under which a point is treated as lying on an edge.
const EDGE_EPSILON: f64 = 1e-9;

/// A 2-D position in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl From<(f64, f64)> for Point {
    fn from((x, y): (f64, f64)) -> Self {
        Self { x, y }
    }
}

impl From<[f64; 2]> for Point {
    fn from([x, y]: [f64; 2]) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned bounds of a region.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: Point,
    pub max: Point,
}

impl Bounds {
    fn contains(&self, p: Point) -> bool {
        p.x >= self.min.x - EDGE_EPSILON
            && p.x <= self.max.x + EDGE_EPSILON
            && p.y >= self.min.y - EDGE_EPSILON
            && p.y <= self.max.y + EDGE_EPSILON
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegionError {
    #[error("region needs at least 3 distinct vertices, got {0}")]
    TooFewVertices(usize),
    #[error("vertex #{index} has a non-finite coordinate")]
    NonFiniteVertex { index: usize },
    #[error("region encloses no area")]
    ZeroArea,
    #[error("region edges #{first} and #{second} intersect")]
    SelfIntersecting { first: usize, second: usize },
}

/// Closed, simple polygon used to decide whether a track is inside the zone.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    vertices: Vec<Point>,
    bounds: Bounds,
}

impl Region {
    /// Validate `vertices` and build a region.
    ///
    /// Consecutive duplicate vertices (including an explicit closing vertex equal
    /// to the first one) are collapsed before validation.
    pub fn new<I, P>(vertices: I) -> Result<Self, RegionError>
    where
        I: IntoIterator<Item = P>,
        P: Into<Point>,
    {
        let mut points: Vec<Point> = Vec::new();
        for (index, vertex) in vertices.into_iter().map(Into::into).enumerate() {
            if !vertex.is_finite() {
                return Err(RegionError::NonFiniteVertex { index });
            }
            if points.last() != Some(&vertex) {
                points.push(vertex);
            }
        }
        while points.len() > 1 && points.first() == points.last() {
            points.pop();
        }

        if points.len() < 3 {
            return Err(RegionError::TooFewVertices(points.len()));
        }
        if let Some((first, second)) = first_intersection(&points) {
            return Err(RegionError::SelfIntersecting { first, second });
        }
        if signed_area(&points).abs() <= EDGE_EPSILON {
            return Err(RegionError::ZeroArea);
        }

        let bounds = bounds_of(&points);
        Ok(Self {
            vertices: points,
            bounds,
        })
    }

    pub fn vertices(&self) -> &[Point] {
        &self.vertices
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    /// Enclosed area in square pixels.
    pub fn area(&self) -> f64 {
        signed_area(&self.vertices).abs()
    }

    /// Area centroid of the polygon.
    pub fn centroid(&self) -> Point {
        let a = signed_area(&self.vertices);
        let (mut cx, mut cy) = (0.0, 0.0);
        for (p, q) in edges(&self.vertices) {
            let cross = p.x * q.y - q.x * p.y;
            cx += (p.x + q.x) * cross;
            cy += (p.y + q.y) * cross;
        }
        Point::new(cx / (6.0 * a), cy / (6.0 * a))
    }

    /// Returns `true` when `point` lies inside the region or on its boundary.
    ///
    /// Pure and deterministic: the same point always yields the same answer, and
    /// non-finite points are never inside.
    pub fn is_inside(&self, point: Point) -> bool {
        if !point.is_finite() || !self.bounds.contains(point) {
            return false;
        }
        if edges(&self.vertices).any(|(a, b)| on_segment(point, a, b)) {
            return true;
        }

        let mut inside = false;
        for (a, b) in edges(&self.vertices) {
            if (a.y > point.y) != (b.y > point.y) {
                let x_cross = a.x + (point.y - a.y) * (b.x - a.x) / (b.y - a.y);
                if point.x < x_cross {
                    inside = !inside;
                }
            }
        }
        inside
    }
}

fn edges(vertices: &[Point]) -> impl Iterator<Item = (Point, Point)> + '_ {
    let n = vertices.len();
    (0..n).map(move |i| (vertices[i], vertices[(i + 1) % n]))
}

fn signed_area(vertices: &[Point]) -> f64 {
    edges(vertices)
        .map(|(p, q)| p.x * q.y - q.x * p.y)
        .sum::<f64>()
        / 2.0
}

fn bounds_of(vertices: &[Point]) -> Bounds {
    let mut min = vertices[0];
    let mut max = vertices[0];
    for v in &vertices[1..] {
        min.x = min.x.min(v.x);
        min.y = min.y.min(v.y);
        max.x = max.x.max(v.x);
        max.y = max.y.max(v.y);
    }
    Bounds { min, max }
}

fn cross(o: Point, a: Point, b: Point) -> f64 {
    (a.x - o.x) * (b.y - o.y) - (a.y - o.y) * (b.x - o.x)
}

fn on_segment(p: Point, a: Point, b: Point) -> bool {
    let len = ((b.x - a.x).powi(2) + (b.y - a.y).powi(2)).sqrt();
    if len == 0.0 {
        return (p.x - a.x).abs() <= EDGE_EPSILON && (p.y - a.y).abs() <= EDGE_EPSILON;
    }
    if cross(a, b, p).abs() > EDGE_EPSILON * len {
        return false;
    }
    let dot = (p.x - a.x) * (b.x - a.x) + (p.y - a.y) * (b.y - a.y);
    dot >= -EDGE_EPSILON * len && dot <= len * len + EDGE_EPSILON * len
}

fn segments_intersect(p1: Point, p2: Point, q1: Point, q2: Point) -> bool {
    let d1 = cross(q1, q2, p1);
    let d2 = cross(q1, q2, p2);
    let d3 = cross(p1, p2, q1);
    let d4 = cross(p1, p2, q2);

    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }

    on_segment(p1, q1, q2)
        || on_segment(p2, q1, q2)
        || on_segment(q1, p1, p2)
        || on_segment(q2, p1, p2)
}

/// Returns the first pair of non-adjacent edges that touch or cross.
fn first_intersection(vertices: &[Point]) -> Option<(usize, usize)> {
    let n = vertices.len();
    for i in 0..n {
        let (a1, a2) = (vertices[i], vertices[(i + 1) % n]);
        for j in (i + 2)..n {
            // The last edge is adjacent to the first one.
            if i == 0 && j == n - 1 {
                continue;
            }
            let (b1, b2) = (vertices[j], vertices[(j + 1) % n]);
            if segments_intersect(a1, a2, b1, b2) {
                return Some((i, j));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Region {
        Region::new([(0.0, 0.0), (10.0, 0.0), (10.0, 10.0), (0.0, 10.0)]).unwrap()
    }

    #[test]
    fn classifies_interior_and_exterior_points() {
        let region = square();
        assert!(region.is_inside(Point::new(5.0, 5.0)));
        assert!(!region.is_inside(Point::new(20.0, 20.0)));
        assert!(!region.is_inside(Point::new(-0.5, 5.0)));
        assert!(!region.is_inside(Point::new(5.0, 10.5)));
    }

    #[test]
    fn boundary_points_are_inside_and_stable() {
        let region = square();
        for p in [
            Point::new(0.0, 5.0),
            Point::new(10.0, 5.0),
            Point::new(5.0, 0.0),
            Point::new(5.0, 10.0),
            Point::new(0.0, 0.0),
            Point::new(10.0, 10.0),
        ] {
            let first = region.is_inside(p);
            assert!(first, "{p:?} should be on the boundary");
            for _ in 0..10 {
                assert_eq!(region.is_inside(p), first);
            }
        }
    }

    #[test]
    fn concave_region_excludes_notch() {
        // U shape opening upwards.
        let region = Region::new([
            (0.0, 0.0),
            (30.0, 0.0),
            (30.0, 30.0),
            (20.0, 30.0),
            (20.0, 10.0),
            (10.0, 10.0),
            (10.0, 30.0),
            (0.0, 30.0),
        ])
        .unwrap();
        assert!(region.is_inside(Point::new(5.0, 20.0)));
        assert!(region.is_inside(Point::new(25.0, 20.0)));
        assert!(!region.is_inside(Point::new(15.0, 20.0)));
        assert!(region.is_inside(Point::new(15.0, 5.0)));
    }

    #[test]
    fn non_finite_points_are_outside() {
        let region = square();
        assert!(!region.is_inside(Point::new(f64::NAN, 5.0)));
        assert!(!region.is_inside(Point::new(5.0, f64::INFINITY)));
    }

    #[test]
    fn rejects_too_few_vertices() {
        let err = Region::new([(0.0, 0.0), (1.0, 1.0)]).unwrap_err();
        assert_eq!(err, RegionError::TooFewVertices(2));

        let err = Region::new([(0.0, 0.0), (1.0, 1.0), (0.0, 0.0)]).unwrap_err();
        assert_eq!(err, RegionError::TooFewVertices(2));
    }

    #[test]
    fn rejects_collinear_vertices() {
        let err = Region::new([(0.0, 0.0), (5.0, 0.0), (10.0, 0.0)]).unwrap_err();
        assert_eq!(err, RegionError::ZeroArea);
    }

    #[test]
    fn rejects_non_finite_vertices() {
        let err = Region::new([(0.0, 0.0), (f64::NAN, 0.0), (10.0, 10.0)]).unwrap_err();
        assert_eq!(err, RegionError::NonFiniteVertex { index: 1 });
    }

    #[test]
    fn rejects_bow_tie() {
        let err = Region::new([(0.0, 0.0), (10.0, 10.0), (10.0, 0.0), (0.0, 10.0)]).unwrap_err();
        assert!(matches!(err, RegionError::SelfIntersecting { .. }));
    }

    #[test]
    fn closing_vertex_is_collapsed() {
        let region = Region::new([
            (0.0, 0.0),
            (10.0, 0.0),
            (10.0, 10.0),
            (0.0, 10.0),
            (0.0, 0.0),
        ])
        .unwrap();
        assert_eq!(region.vertices().len(), 4);
    }

    #[test]
    fn area_and_centroid() {
        let region = square();
        assert_eq!(region.area(), 100.0);
        let c = region.centroid();
        assert!((c.x - 5.0).abs() < 1e-9);
        assert!((c.y - 5.0).abs() < 1e-9);
        assert_eq!(region.bounds().max, Point::new(10.0, 10.0));
    }
}
