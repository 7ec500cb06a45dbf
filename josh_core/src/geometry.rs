use crate::error::{EngineError, Result};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Coordinate space a geometry was declared in. Every geometry also carries
/// its grid-space projection, which is what intersection tests and spatial
/// keys operate on.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Space {
    Grid,
    Earth,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Shape {
    Point,
    Circle { radius: f64 },
    Square { width: f64 },
}

impl Shape {
    fn half_extent(&self) -> f64 {
        match self {
            Shape::Point => 0.0,
            Shape::Circle { radius } => *radius,
            Shape::Square { width } => width / 2.0,
        }
    }
}

/// Projection of earth coordinates onto the simulation grid. Implemented by
/// the surface layer; the engine only requires the two mappings below.
pub trait EarthTransform: Send + Sync {
    fn to_grid(&self, x: f64, y: f64) -> (f64, f64);
    fn length_to_grid(&self, length: f64) -> f64;
}

/// Axis-aligned bounding box in grid space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Envelope {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

/// A point, circle, or square in grid or earth space.
///
/// The native coordinates are kept for display and for the surface layer;
/// all geometric predicates run on the grid projection so that mixed-space
/// comparisons are well defined.
#[derive(Clone, Debug, PartialEq)]
pub struct Geometry {
    shape: Shape,
    space: Space,
    x: f64,
    y: f64,
    grid_x: f64,
    grid_y: f64,
    grid_shape: Shape,
}

impl Geometry {
    fn new_grid(shape: Shape, x: f64, y: f64) -> Geometry {
        Geometry {
            shape,
            space: Space::Grid,
            x,
            y,
            grid_x: x,
            grid_y: y,
            grid_shape: shape,
        }
    }

    fn new_earth(shape: Shape, x: f64, y: f64, transform: &dyn EarthTransform) -> Geometry {
        let (grid_x, grid_y) = transform.to_grid(x, y);
        let grid_shape = match shape {
            Shape::Point => Shape::Point,
            Shape::Circle { radius } => Shape::Circle {
                radius: transform.length_to_grid(radius),
            },
            Shape::Square { width } => Shape::Square {
                width: transform.length_to_grid(width),
            },
        };
        Geometry {
            shape,
            space: Space::Earth,
            x,
            y,
            grid_x,
            grid_y,
            grid_shape,
        }
    }

    pub fn center_x(&self) -> f64 {
        self.x
    }

    pub fn center_y(&self) -> f64 {
        self.y
    }

    pub fn shape(&self) -> Shape {
        self.shape
    }

    pub fn space(&self) -> Space {
        self.space
    }

    pub fn on_grid(&self) -> bool {
        self.space == Space::Grid
    }

    pub fn on_earth(&self) -> bool {
        self.space == Space::Earth
    }

    /// Grid-space center and shape, the identity used by [`GeoKey`].
    pub fn grid_footprint(&self) -> (f64, f64, Shape) {
        (self.grid_x, self.grid_y, self.grid_shape)
    }

    pub fn envelope(&self) -> Envelope {
        let h = self.grid_shape.half_extent();
        Envelope {
            min_x: self.grid_x - h,
            min_y: self.grid_y - h,
            max_x: self.grid_x + h,
            max_y: self.grid_y + h,
        }
    }

    /// Whether the grid projections of two geometries touch or overlap.
    /// Boundaries are inclusive.
    pub fn intersects(&self, other: &Geometry) -> bool {
        let (ax, ay, a) = self.grid_footprint();
        let (bx, by, b) = other.grid_footprint();
        match (a, b) {
            (Shape::Point, Shape::Point) => ax == bx && ay == by,
            (Shape::Point, _) => other.intersects_point(ax, ay),
            (_, Shape::Point) => self.intersects_point(bx, by),
            (Shape::Circle { radius: ra }, Shape::Circle { radius: rb }) => {
                distance_squared(ax, ay, bx, by) <= (ra + rb) * (ra + rb)
            }
            (Shape::Square { width: wa }, Shape::Square { width: wb }) => {
                let reach = (wa + wb) / 2.0;
                (ax - bx).abs() <= reach && (ay - by).abs() <= reach
            }
            (Shape::Circle { radius }, Shape::Square { width }) => {
                circle_touches_square(ax, ay, radius, bx, by, width)
            }
            (Shape::Square { width }, Shape::Circle { radius }) => {
                circle_touches_square(bx, by, radius, ax, ay, width)
            }
        }
    }

    /// Whether a grid-space point falls inside (or on the boundary of) the
    /// grid projection of this geometry.
    pub fn intersects_point(&self, x: f64, y: f64) -> bool {
        let (gx, gy, shape) = self.grid_footprint();
        match shape {
            Shape::Point => gx == x && gy == y,
            Shape::Circle { radius } => distance_squared(gx, gy, x, y) <= radius * radius,
            Shape::Square { width } => {
                (gx - x).abs() <= width / 2.0 && (gy - y).abs() <= width / 2.0
            }
        }
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let space = match self.space {
            Space::Grid => "grid",
            Space::Earth => "earth",
        };
        match self.shape {
            Shape::Point => write!(f, "point({}, {}) {}", self.x, self.y, space),
            Shape::Circle { radius } => {
                write!(f, "circle({}, {}, r={}) {}", self.x, self.y, radius, space)
            }
            Shape::Square { width } => {
                write!(f, "square({}, {}, w={}) {}", self.x, self.y, width, space)
            }
        }
    }
}

fn distance_squared(ax: f64, ay: f64, bx: f64, by: f64) -> f64 {
    let dx = ax - bx;
    let dy = ay - by;
    dx * dx + dy * dy
}

fn circle_touches_square(cx: f64, cy: f64, radius: f64, sx: f64, sy: f64, width: f64) -> bool {
    let half = width / 2.0;
    let nearest_x = cx.max(sx - half).min(sx + half);
    let nearest_y = cy.max(sy - half).min(sy + half);
    distance_squared(cx, cy, nearest_x, nearest_y) <= radius * radius
}

/// Builds geometries, projecting earth-space declarations onto the grid
/// through the transform supplied by the surface layer.
#[derive(Clone)]
pub struct GeometryFactory {
    transform: Option<Arc<dyn EarthTransform>>,
}

impl GeometryFactory {
    /// Factory for simulations declared directly in grid coordinates.
    pub fn grid() -> GeometryFactory {
        GeometryFactory { transform: None }
    }

    pub fn with_transform(transform: Arc<dyn EarthTransform>) -> GeometryFactory {
        GeometryFactory {
            transform: Some(transform),
        }
    }

    pub fn point(&self, x: f64, y: f64, space: Space) -> Result<Geometry> {
        self.build(Shape::Point, x, y, space)
    }

    pub fn circle(&self, x: f64, y: f64, radius: f64, space: Space) -> Result<Geometry> {
        self.build(Shape::Circle { radius }, x, y, space)
    }

    pub fn square(&self, x: f64, y: f64, width: f64, space: Space) -> Result<Geometry> {
        self.build(Shape::Square { width }, x, y, space)
    }

    /// Square from its top-left and bottom-right corners. Non-square input
    /// takes the wider edge.
    pub fn square_from_corners(
        &self,
        left: f64,
        top: f64,
        right: f64,
        bottom: f64,
        space: Space,
    ) -> Result<Geometry> {
        let width = (right - left).abs().max((top - bottom).abs());
        self.build(
            Shape::Square { width },
            (left + right) / 2.0,
            (top + bottom) / 2.0,
            space,
        )
    }

    fn build(&self, shape: Shape, x: f64, y: f64, space: Space) -> Result<Geometry> {
        match space {
            Space::Grid => Ok(Geometry::new_grid(shape, x, y)),
            Space::Earth => match &self.transform {
                Some(transform) => Ok(Geometry::new_earth(shape, x, y, transform.as_ref())),
                None => Err(EngineError::program(
                    "earth-space geometry requires an earth transform",
                )),
            },
        }
    }
}

const KEY_QUANTUM: f64 = 1e6;

fn quantize(v: f64) -> i64 {
    (v * KEY_QUANTUM).round() as i64
}

/// Location-based identifier for spatial maps.
///
/// Equality and hashing consider only the grid projection of the geometry:
/// two keys for the same location compare equal even when they belong to
/// different entities. `name` and `sequence` are carried for display. Use
/// [`IdentityKey`] when set-of-entity semantics are needed instead.
#[derive(Clone, Debug)]
pub struct GeoKey {
    geometry: Arc<Geometry>,
    name: Arc<str>,
    sequence: u64,
}

impl GeoKey {
    pub fn new(geometry: Arc<Geometry>, name: Arc<str>, sequence: u64) -> GeoKey {
        GeoKey {
            geometry,
            name,
            sequence,
        }
    }

    pub fn geometry(&self) -> &Arc<Geometry> {
        &self.geometry
    }

    pub fn entity_name(&self) -> &str {
        &self.name
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    fn grid_identity(&self) -> (i64, i64, u8, i64) {
        let (x, y, shape) = self.geometry.grid_footprint();
        let (tag, extent) = match shape {
            Shape::Point => (0u8, 0.0),
            Shape::Circle { radius } => (1u8, radius),
            Shape::Square { width } => (2u8, width),
        };
        (quantize(x), quantize(y), tag, quantize(extent))
    }
}

impl PartialEq for GeoKey {
    fn eq(&self, other: &GeoKey) -> bool {
        self.grid_identity() == other.grid_identity()
    }
}

impl Eq for GeoKey {}

impl Hash for GeoKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.grid_identity().hash(state);
    }
}

impl fmt::Display for GeoKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}#{}@({}, {})",
            self.name, self.sequence, self.geometry.grid_x, self.geometry.grid_y
        )
    }
}

/// Entity identity for set membership, where two co-located entities must
/// stay distinct.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct IdentityKey {
    pub name: Arc<str>,
    pub sequence: u64,
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> GeometryFactory {
        GeometryFactory::grid()
    }

    #[test]
    fn circle_reaches_adjacent_square() {
        let f = factory();
        let probe = f.circle(0.0, 0.0, 1.0, Space::Grid).unwrap();
        let own = f.square(0.0, 0.0, 1.0, Space::Grid).unwrap();
        let near = f.square(0.0, 1.0, 1.0, Space::Grid).unwrap();
        let far = f.square(0.0, 2.0, 1.0, Space::Grid).unwrap();
        assert!(probe.intersects(&own));
        assert!(probe.intersects(&near));
        assert!(!probe.intersects(&far));
    }

    #[test]
    fn square_overlap_is_inclusive() {
        let f = factory();
        let a = f.square(0.0, 0.0, 2.0, Space::Grid).unwrap();
        let b = f.square(2.0, 0.0, 2.0, Space::Grid).unwrap();
        let c = f.square(2.1, 0.0, 2.0, Space::Grid).unwrap();
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
    }

    #[test]
    fn point_membership() {
        let f = factory();
        let square = f.square(0.0, 0.0, 2.0, Space::Grid).unwrap();
        assert!(square.intersects_point(1.0, 1.0));
        assert!(!square.intersects_point(1.01, 0.0));
        let circle = f.circle(0.0, 0.0, 1.0, Space::Grid).unwrap();
        assert!(circle.intersects_point(0.0, 1.0));
        assert!(!circle.intersects_point(0.8, 0.8));
    }

    #[test]
    fn corners_build_centered_square() {
        let f = factory();
        let square = f
            .square_from_corners(0.0, 2.0, 2.0, 0.0, Space::Grid)
            .unwrap();
        assert_eq!(square.center_x(), 1.0);
        assert_eq!(square.center_y(), 1.0);
        assert_eq!(square.shape(), Shape::Square { width: 2.0 });
    }

    #[test]
    fn earth_space_requires_transform() {
        let f = factory();
        assert!(f.point(0.0, 0.0, Space::Earth).is_err());
    }

    struct Shift;

    impl EarthTransform for Shift {
        fn to_grid(&self, x: f64, y: f64) -> (f64, f64) {
            (x - 100.0, y - 200.0)
        }

        fn length_to_grid(&self, length: f64) -> f64 {
            length / 10.0
        }
    }

    #[test]
    fn earth_geometry_projects_through_transform() {
        let f = GeometryFactory::with_transform(Arc::new(Shift));
        let circle = f.circle(101.0, 202.0, 20.0, Space::Earth).unwrap();
        assert!(circle.on_earth());
        let (gx, gy, shape) = circle.grid_footprint();
        assert_eq!((gx, gy), (1.0, 2.0));
        assert_eq!(shape, Shape::Circle { radius: 2.0 });
        // Native coordinates are preserved for display.
        assert_eq!(circle.center_x(), 101.0);
    }

    #[test]
    fn geokey_identity_is_location_only() {
        let f = factory();
        let here = Arc::new(f.square(3.0, 4.0, 1.0, Space::Grid).unwrap());
        let a = GeoKey::new(here.clone(), Arc::from("Patch"), 1);
        let b = GeoKey::new(here.clone(), Arc::from("Patch"), 2);
        assert_eq!(a, b);

        let elsewhere = Arc::new(f.square(3.0, 5.0, 1.0, Space::Grid).unwrap());
        let c = GeoKey::new(elsewhere, Arc::from("Patch"), 1);
        assert_ne!(a, c);
    }

    #[test]
    fn identity_key_distinguishes_sequences() {
        let a = IdentityKey {
            name: Arc::from("Tree"),
            sequence: 1,
        };
        let b = IdentityKey {
            name: Arc::from("Tree"),
            sequence: 2,
        };
        assert_ne!(a, b);
    }
}
