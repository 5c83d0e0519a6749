//! Validation and measurement of drawn areas of interest.
//!
//! Geometries arrive as Esri JSON polygons (`rings` + `spatialReference`). The geometric
//! operators are an injected capability set so a map SDK can supply its own; [`BuiltinOperators`]
//! is a pure Rust implementation.

use std::{f64::consts::PI, ops::RangeInclusive};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Radius of the sphere with the same surface area as the WGS84 ellipsoid, in meters.
const AUTHALIC_RADIUS: f64 = 6_371_007.180_9;
/// Semi-major axis used by Web Mercator, in meters.
const WEB_MERCATOR_RADIUS: f64 = 6_378_137.0;
const WEB_MERCATOR_WKIDS: &[u32] = &[3857, 102100, 102113, 900913];
const EPSILON: f64 = 1e-12;
// EPSG 4001..=4999, Esri spheres 37001..=37008, Esri astro systems 37201..=37260 and
// Esri geographic systems 104000..=104999.
const GEOGRAPHIC_WKIDS: &[RangeInclusive<u32>] = &[4001..=4999, 37001..=37008, 37201..=37260, 104000..=104999];

/// Rejected geometry. Reported to the user, never thrown past the evaluator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GeometryError {
    /// Nothing was drawn.
    #[error("no geometry was provided")]
    Missing,
    /// The geometry is not a polygon.
    #[error("geometry is not a polygon: {0}")]
    TypeInvalid(String),
    /// A ring has fewer than three distinct vertices.
    #[error("polygon ring has {distinct} distinct vertices, at least 3 are required")]
    MinVertices {
        /// Distinct vertices found in the offending ring.
        distinct: usize,
    },
    /// Two edges of a ring cross.
    #[error("polygon is self-intersecting")]
    SelfIntersecting,
    /// The polygon encloses no area.
    #[error("polygon has zero area")]
    ZeroArea,
}

impl GeometryError {
    /// Stable error code.
    pub fn code(&self) -> &'static str {
        match self {
            GeometryError::Missing => "GEOMETRY_MISSING",
            GeometryError::TypeInvalid(_) => "GEOMETRY_TYPE_INVALID",
            GeometryError::MinVertices { .. } => "GEOMETRY_MIN_VERTICES",
            GeometryError::SelfIntersecting => "GEOM_SELF_INTERSECTING",
            GeometryError::ZeroArea => "GEOMETRY_ZERO_AREA",
        }
    }

    /// Key of the user-facing message.
    pub fn message_key(&self) -> &'static str {
        match self {
            GeometryError::Missing => "geometryMissing",
            GeometryError::TypeInvalid(_) => "geometryTypeInvalid",
            GeometryError::MinVertices { .. } => "polygonMinVertices",
            GeometryError::SelfIntersecting => "geometrySelfIntersecting",
            GeometryError::ZeroArea => "geometryZeroArea",
        }
    }
}

/// Coordinate system of a geometry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpatialReference {
    /// Well-known id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wkid: Option<u32>,
    /// Latest well-known id, preferred when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_wkid: Option<u32>,
}

impl SpatialReference {
    /// Spatial reference with the given well-known id.
    pub fn from_wkid(wkid: u32) -> Self {
        Self {
            wkid: Some(wkid),
            latest_wkid: None,
        }
    }

    fn ids(&self) -> impl Iterator<Item = u32> {
        self.latest_wkid.into_iter().chain(self.wkid)
    }

    /// Geographic (longitude/latitude) coordinate system.
    ///
    /// Recognizes the EPSG geographic 2D range and the Esri geographic ranges. Custom
    /// (well-known text only) references are treated as projected.
    pub fn is_geographic(&self) -> bool {
        self.ids().any(|wkid| GEOGRAPHIC_WKIDS.iter().any(|range| range.contains(&wkid)))
    }

    /// Web Mercator, under any of its historical ids.
    pub fn is_web_mercator(&self) -> bool {
        self.ids().any(|wkid| WEB_MERCATOR_WKIDS.contains(&wkid))
    }
}

/// Point as `[x, y]`.
pub type Point = [f64; 2];

/// Polygon made of one or more rings.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    /// Rings in drawing order. A ring may or may not repeat its first vertex at the end.
    pub rings: Vec<Vec<Point>>,
    /// Coordinate system, if known.
    pub spatial_reference: Option<SpatialReference>,
}

impl Polygon {
    /// Parses an Esri JSON polygon.
    pub fn from_json(value: &Value) -> Result<Self, GeometryError> {
        let object = match value {
            Value::Null => return Err(GeometryError::Missing),
            Value::Object(object) => object,
            other => return Err(GeometryError::TypeInvalid(json_kind(other).to_string())),
        };

        if let Some(kind) = object.get("type").and_then(Value::as_str) {
            if !kind.eq_ignore_ascii_case("polygon") {
                return Err(GeometryError::TypeInvalid(kind.to_string()));
            }
        }

        let rings = object
            .get("rings")
            .and_then(Value::as_array)
            .ok_or_else(|| GeometryError::TypeInvalid("missing rings".to_string()))?
            .iter()
            .map(parse_ring)
            .collect::<Result<Vec<_>, _>>()?;

        let spatial_reference = object
            .get("spatialReference")
            .and_then(|value| serde_json::from_value(value.clone()).ok());

        Ok(Self {
            rings,
            spatial_reference,
        })
    }

    /// Esri JSON representation, as sent in the area of interest parameter.
    pub fn to_json(&self) -> Value {
        let mut value = json!({ "rings": self.rings });
        if let Some(spatial_reference) = &self.spatial_reference {
            value["spatialReference"] = json!(spatial_reference);
        }
        value
    }

    fn is_geodesic(&self) -> bool {
        self.spatial_reference
            .map(|sr| sr.is_geographic() || sr.is_web_mercator())
            .unwrap_or(false)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn parse_ring(value: &Value) -> Result<Vec<Point>, GeometryError> {
    let invalid = || GeometryError::TypeInvalid("malformed ring".to_string());
    value
        .as_array()
        .ok_or_else(invalid)?
        .iter()
        .map(|point| {
            let coords = point.as_array().ok_or_else(invalid)?;
            match (
                coords.first().and_then(Value::as_f64),
                coords.get(1).and_then(Value::as_f64),
            ) {
                (Some(x), Some(y)) => Ok([x, y]),
                _ => Err(invalid()),
            }
        })
        .collect()
}

/// Ring without its closing vertex.
fn open_ring(ring: &[Point]) -> &[Point] {
    match ring {
        [first, .., last] if same_point(first, last) => &ring[..ring.len() - 1],
        _ => ring,
    }
}

fn same_point(a: &Point, b: &Point) -> bool {
    (a[0] - b[0]).abs() <= EPSILON && (a[1] - b[1]).abs() <= EPSILON
}

fn distinct_vertices(ring: &[Point]) -> usize {
    let mut distinct: Vec<Point> = Vec::with_capacity(ring.len());
    for point in ring {
        if !distinct.iter().any(|seen| same_point(seen, point)) {
            distinct.push(*point);
        }
    }
    distinct.len()
}

/// Geometric capabilities consumed by the evaluator.
#[async_trait(?Send)]
pub trait GeometryOperators {
    /// Cleans up a freshly drawn polygon.
    async fn simplify(&self, polygon: &Polygon) -> Polygon;
    /// Returns false if any ring crosses itself.
    async fn is_simple(&self, polygon: &Polygon) -> bool;
    /// Area in squared coordinate units. May be negative depending on ring orientation.
    async fn planar_area(&self, polygon: &Polygon) -> f64;
    /// Area on the earth's surface in square meters. May be negative depending on ring orientation.
    async fn geodesic_area(&self, polygon: &Polygon) -> f64;
}

/// Pure Rust [`GeometryOperators`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinOperators;

#[async_trait(?Send)]
impl GeometryOperators for BuiltinOperators {
    async fn simplify(&self, polygon: &Polygon) -> Polygon {
        let rings = polygon
            .rings
            .iter()
            .map(|ring| {
                let mut cleaned: Vec<Point> = Vec::with_capacity(ring.len() + 1);
                for point in open_ring(ring) {
                    if cleaned.last().map_or(true, |last| !same_point(last, point)) {
                        cleaned.push(*point);
                    }
                }
                if let Some(first) = cleaned.first().copied() {
                    while cleaned.len() > 1 && cleaned.last().map_or(false, |last| same_point(last, &first)) {
                        cleaned.pop();
                    }
                    cleaned.push(first);
                }
                cleaned
            })
            .filter(|ring| ring.len() >= 4)
            .collect();
        Polygon {
            rings,
            spatial_reference: polygon.spatial_reference,
        }
    }

    async fn is_simple(&self, polygon: &Polygon) -> bool {
        polygon.rings.iter().all(|ring| {
            let mut vertices: Vec<Point> = Vec::with_capacity(ring.len());
            for point in open_ring(ring) {
                // Repeated vertices are zero-length edges, not crossings.
                if vertices.last().map_or(true, |last| !same_point(last, point)) {
                    vertices.push(*point);
                }
            }
            while vertices.len() > 1 && same_point(&vertices[0], &vertices[vertices.len() - 1]) {
                vertices.pop();
            }
            ring_is_simple(&vertices)
        })
    }

    async fn planar_area(&self, polygon: &Polygon) -> f64 {
        polygon
            .rings
            .iter()
            .map(|ring| shoelace(open_ring(ring)))
            .sum()
    }

    async fn geodesic_area(&self, polygon: &Polygon) -> f64 {
        let web_mercator = polygon
            .spatial_reference
            .map(|sr| sr.is_web_mercator())
            .unwrap_or(false);
        polygon
            .rings
            .iter()
            .map(|ring| {
                let lon_lat: Vec<Point> = open_ring(ring)
                    .iter()
                    .map(|point| {
                        if web_mercator {
                            unproject_web_mercator(*point)
                        } else {
                            *point
                        }
                    })
                    .collect();
                spherical_area(&lon_lat)
            })
            .sum()
    }
}

fn shoelace(ring: &[Point]) -> f64 {
    let n = ring.len();
    if n < 3 {
        return 0.0;
    }
    let twice_area: f64 = (0..n)
        .map(|i| {
            let [x1, y1] = ring[i];
            let [x2, y2] = ring[(i + 1) % n];
            x1 * y2 - x2 * y1
        })
        .sum();
    twice_area / 2.0
}

/// Signed area of a lon/lat ring on the authalic sphere.
fn spherical_area(ring: &[Point]) -> f64 {
    let n = ring.len();
    if n < 3 {
        return 0.0;
    }
    let sum: f64 = (0..n)
        .map(|i| {
            let [lon1, lat1] = ring[i];
            let [lon2, lat2] = ring[(i + 1) % n];
            (lon2 - lon1).to_radians() * (2.0 + lat1.to_radians().sin() + lat2.to_radians().sin())
        })
        .sum();
    sum * AUTHALIC_RADIUS * AUTHALIC_RADIUS / 2.0
}

/// Web Mercator meters to longitude/latitude degrees.
pub fn unproject_web_mercator([x, y]: Point) -> Point {
    let lon = x / WEB_MERCATOR_RADIUS * 180.0 / PI;
    let lat = (2.0 * (y / WEB_MERCATOR_RADIUS).exp().atan() - PI / 2.0) * 180.0 / PI;
    [lon, lat]
}

fn ring_is_simple(ring: &[Point]) -> bool {
    let n = ring.len();
    if n < 4 {
        return true;
    }
    for i in 0..n {
        let a = (ring[i], ring[(i + 1) % n]);
        for j in (i + 2)..n {
            // The last edge shares a vertex with the first one.
            if i == 0 && j == n - 1 {
                continue;
            }
            let b = (ring[j], ring[(j + 1) % n]);
            if segments_intersect(a, b) {
                return false;
            }
        }
    }
    true
}

fn orientation(p: Point, q: Point, r: Point) -> f64 {
    (q[0] - p[0]) * (r[1] - p[1]) - (q[1] - p[1]) * (r[0] - p[0])
}

fn on_segment(p: Point, q: Point, r: Point) -> bool {
    r[0] >= p[0].min(q[0]) - EPSILON
        && r[0] <= p[0].max(q[0]) + EPSILON
        && r[1] >= p[1].min(q[1]) - EPSILON
        && r[1] <= p[1].max(q[1]) + EPSILON
}

fn segments_intersect((p1, p2): (Point, Point), (q1, q2): (Point, Point)) -> bool {
    let d1 = orientation(q1, q2, p1);
    let d2 = orientation(q1, q2, p2);
    let d3 = orientation(p1, p2, q1);
    let d4 = orientation(p1, p2, q2);

    if ((d1 > EPSILON && d2 < -EPSILON) || (d1 < -EPSILON && d2 > EPSILON))
        && ((d3 > EPSILON && d4 < -EPSILON) || (d3 < -EPSILON && d4 > EPSILON))
    {
        return true;
    }

    (d1.abs() <= EPSILON && on_segment(q1, q2, p1))
        || (d2.abs() <= EPSILON && on_segment(q1, q2, p2))
        || (d3.abs() <= EPSILON && on_segment(p1, p2, q1))
        || (d4.abs() <= EPSILON && on_segment(p1, p2, q2))
}

/// Optional, independently configured area limits.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AreaThresholds {
    /// Areas above this are rejected.
    pub max_area: Option<f64>,
    /// Areas above this are flagged and may force asynchronous submission.
    pub large_area: Option<f64>,
}

/// Classification of an area against [`AreaThresholds`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AreaEvaluation {
    /// The area is above the maximum. Submission must be blocked.
    pub exceeds_maximum: bool,
    /// The area is above the warning threshold.
    pub should_warn: bool,
}

/// Classifies `area` against `thresholds`. Unset thresholds never trigger.
pub fn evaluate_area(area: f64, thresholds: AreaThresholds) -> AreaEvaluation {
    AreaEvaluation {
        exceeds_maximum: thresholds.max_area.map_or(false, |max| area > max),
        should_warn: thresholds.large_area.map_or(false, |large| area > large),
    }
}

/// Result of evaluating a drawn geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct DrawingEvaluation {
    /// The simplified polygon.
    pub polygon: Polygon,
    /// Absolute area.
    pub area: f64,
    /// Threshold classification of `area`.
    pub evaluation: AreaEvaluation,
}

/// Validates drawn polygons and measures them.
#[derive(Debug, Clone, Default)]
pub struct GeometryEvaluator<O = BuiltinOperators> {
    operators: O,
}

impl<O> GeometryEvaluator<O>
where
    O: GeometryOperators,
{
    /// Evaluator backed by `operators`.
    pub fn new(operators: O) -> Self {
        Self { operators }
    }

    /// Parses and validates a drawn geometry, returning its simplified form.
    pub async fn validate(&self, raw: Option<&Value>) -> Result<Polygon, GeometryError> {
        let polygon = Polygon::from_json(raw.ok_or(GeometryError::Missing)?)?;

        if polygon.rings.iter().all(|ring| ring.is_empty()) {
            return Err(GeometryError::MinVertices { distinct: 0 });
        }
        for ring in &polygon.rings {
            let distinct = distinct_vertices(ring);
            if distinct < 3 {
                return Err(GeometryError::MinVertices { distinct });
            }
        }

        let polygon = self.operators.simplify(&polygon).await;
        if !self.operators.is_simple(&polygon).await {
            return Err(GeometryError::SelfIntersecting);
        }

        if self.area(&polygon).await <= EPSILON {
            return Err(GeometryError::ZeroArea);
        }
        Ok(polygon)
    }

    /// Absolute area: geodesic for geographic and Web Mercator references, planar otherwise.
    pub async fn area(&self, polygon: &Polygon) -> f64 {
        let area = if polygon.is_geodesic() {
            self.operators.geodesic_area(polygon).await
        } else {
            self.operators.planar_area(polygon).await
        };
        if area.is_finite() {
            area.abs()
        } else {
            0.0
        }
    }

    /// Validates, measures and classifies a drawn geometry.
    pub async fn evaluate(
        &self,
        raw: Option<&Value>,
        thresholds: AreaThresholds,
    ) -> Result<DrawingEvaluation, GeometryError> {
        let polygon = self.validate(raw).await?;
        let area = self.area(&polygon).await;
        Ok(DrawingEvaluation {
            polygon,
            area,
            evaluation: evaluate_area(area, thresholds),
        })
    }
}
