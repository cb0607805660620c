//! Geometry kernel: bounding boxes, IoU, polygon tests, ROI acceptance.
//!
//! Pure functions, no state. Detections are filtered against regions of
//! interest before any temporal logic runs, so everything here has to be
//! cheap and allocation-free.

use serde::{Deserialize, Serialize};

/// Axis-aligned bounding box in pixel coordinates, `x2 > x1`, `y2 > y1`.
///
/// Serialised on the wire as a `[x1, y1, x2, y2]` array to match the event
/// stream consumers.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f32; 4]", into = "[f32; 4]")]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center(&self) -> [f32; 2] {
        [(self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0]
    }

    /// Well-formed: positive extent in both axes, no negative coordinates.
    pub fn is_well_formed(&self) -> bool {
        self.x1 >= 0.0 && self.y1 >= 0.0 && self.x2 > self.x1 && self.y2 > self.y1
    }

    pub fn corners(&self) -> [[f32; 2]; 4] {
        [
            [self.x1, self.y1],
            [self.x2, self.y1],
            [self.x2, self.y2],
            [self.x1, self.y2],
        ]
    }
}

impl From<[f32; 4]> for BBox {
    fn from(v: [f32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BBox> for [f32; 4] {
    fn from(b: BBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

/// Polygon as a list of `[x, y]` vertices. Fewer than 3 vertices is an
/// empty polygon (contains nothing).
pub type Polygon = Vec<[f32; 2]>;

/// Intersection over union of two boxes.
///
/// Returns 0.0 for non-overlapping or degenerate (zero-area) inputs.
pub fn iou(a: &BBox, b: &BBox) -> f32 {
    let ix1 = a.x1.max(b.x1);
    let iy1 = a.y1.max(b.y1);
    let ix2 = a.x2.min(b.x2);
    let iy2 = a.y2.min(b.y2);

    let iw = ix2 - ix1;
    let ih = iy2 - iy1;
    if iw <= 0.0 || ih <= 0.0 {
        return 0.0;
    }

    let intersection = iw * ih;
    let union = a.area() + b.area() - intersection;
    if union <= 0.0 {
        return 0.0;
    }
    intersection / union
}

/// Ray-cast point-in-polygon test.
///
/// Boundary points may land on either side; callers must not rely on edge
/// membership.
pub fn point_in_polygon(point: [f32; 2], polygon: &[[f32; 2]]) -> bool {
    if polygon.len() < 3 {
        return false;
    }

    let [px, py] = point;
    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let [xi, yi] = polygon[i];
        let [xj, yj] = polygon[j];
        if (yi > py) != (yj > py) {
            let x_cross = (xj - xi) * (py - yi) / (yj - yi) + xi;
            if px < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

/// How a bounding box must relate to the ROI polygons to be accepted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoiMode {
    /// Box midpoint lies inside at least one polygon.
    #[default]
    Center,
    /// Any corner lies inside at least one polygon.
    Any,
    /// All four corners lie inside the same polygon.
    All,
    /// Intersection area / box area reaches `min_overlap` for some polygon.
    Overlap,
}

impl std::str::FromStr for RoiMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "center" => Ok(Self::Center),
            "any" => Ok(Self::Any),
            "all" => Ok(Self::All),
            "overlap" => Ok(Self::Overlap),
            other => Err(format!(
                "invalid roi mode '{}', expected center|any|all|overlap",
                other
            )),
        }
    }
}

/// ROI acceptance test. An empty polygon list means "no filtering".
pub fn bbox_accepted_by_roi(
    bbox: &BBox,
    polygons: &[Polygon],
    mode: RoiMode,
    min_overlap: f32,
) -> bool {
    if polygons.is_empty() {
        return true;
    }

    match mode {
        RoiMode::Center => {
            let center = bbox.center();
            polygons.iter().any(|poly| point_in_polygon(center, poly))
        }
        RoiMode::Any => bbox
            .corners()
            .iter()
            .any(|corner| polygons.iter().any(|poly| point_in_polygon(*corner, poly))),
        RoiMode::All => polygons.iter().any(|poly| {
            bbox.corners()
                .iter()
                .all(|corner| point_in_polygon(*corner, poly))
        }),
        RoiMode::Overlap => {
            let area = bbox.area();
            if area <= 0.0 {
                return false;
            }
            polygons
                .iter()
                .any(|poly| polygon_bbox_intersection_area(poly, bbox) / area >= min_overlap)
        }
    }
}

/// Area of `polygon ∩ bbox`, computed by clipping the polygon against each
/// box edge (Sutherland-Hodgman) and taking the shoelace area of the rest.
fn polygon_bbox_intersection_area(polygon: &[[f32; 2]], bbox: &BBox) -> f32 {
    if polygon.len() < 3 {
        return 0.0;
    }

    // Each clip edge keeps points satisfying `keep` and intersects the
    // crossing segments with the edge line.
    let mut clipped: Vec<[f32; 2]> = polygon.to_vec();
    let edges: [(bool, f32, bool); 4] = [
        (true, bbox.x1, true),   // x >= x1
        (true, bbox.x2, false),  // x <= x2
        (false, bbox.y1, true),  // y >= y1
        (false, bbox.y2, false), // y <= y2
    ];

    for (is_x, bound, keep_greater) in edges {
        if clipped.len() < 3 {
            return 0.0;
        }
        let input = std::mem::take(&mut clipped);
        let inside = |p: [f32; 2]| {
            let v = if is_x { p[0] } else { p[1] };
            if keep_greater {
                v >= bound
            } else {
                v <= bound
            }
        };
        let intersect = |a: [f32; 2], b: [f32; 2]| -> [f32; 2] {
            let (av, bv) = if is_x { (a[0], b[0]) } else { (a[1], b[1]) };
            let t = (bound - av) / (bv - av);
            [a[0] + t * (b[0] - a[0]), a[1] + t * (b[1] - a[1])]
        };

        let mut prev = input[input.len() - 1];
        for current in input {
            match (inside(prev), inside(current)) {
                (true, true) => clipped.push(current),
                (true, false) => clipped.push(intersect(prev, current)),
                (false, true) => {
                    clipped.push(intersect(prev, current));
                    clipped.push(current);
                }
                (false, false) => {}
            }
            prev = current;
        }
    }

    shoelace_area(&clipped)
}

fn shoelace_area(polygon: &[[f32; 2]]) -> f32 {
    if polygon.len() < 3 {
        return 0.0;
    }
    let mut twice_area = 0.0;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        twice_area += polygon[j][0] * polygon[i][1] - polygon[i][0] * polygon[j][1];
        j = i;
    }
    (twice_area / 2.0).abs()
}
