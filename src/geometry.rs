//! Geometry kernel.
//!
//! Pure, stateless routines on fixed-size 3-vectors: projections onto
//! segments, triangles and convex polygons with barycentric coordinates,
//! the matching distance queries, intersection predicates, and an
//! axis-aligned bounding box toolbox. The mesh core consumes only a small
//! part of this module (point location, cell boxes); the rest is exposed
//! for embedding applications.
//!
//! Predicates report degeneracies (parallel lines, zero-area overlaps)
//! through their return value, never through errors. Intersection points
//! are returned only when the predicate holds.

use crate::error::{MeshError, Result};

/// A point or vector in three-dimensional space.
pub type Point3 = [f64; 3];

/// Baseline absolute tolerance of the geometric predicates.
pub const DEFAULT_ABS_TOL: f64 = 1.0e-14;

// Line/line closest-point distance below which supporting lines are
// considered intersecting.
const LINE_INTERSECTION_TOL: f64 = 1.0e-12;

/// The dot product of two vectors.
pub fn dot_product(a: &Point3, b: &Point3) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// The cross product of two vectors.
pub fn cross_product(a: &Point3, b: &Point3) -> Point3 {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

/// The Euclidean norm of a vector.
pub fn norm2(a: &Point3) -> f64 {
    dot_product(a, a).sqrt()
}

fn sub(a: &Point3, b: &Point3) -> Point3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

fn add(a: &Point3, b: &Point3) -> Point3 {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

fn scaled(a: &Point3, s: f64) -> Point3 {
    [a[0] * s, a[1] * s, a[2] * s]
}

fn normalized(a: &Point3) -> Point3 {
    scaled(a, 1.0 / norm2(a))
}

// ------------------------------------------------------------------------
// Barycentric reconstruction and flags
// ------------------------------------------------------------------------

/// Reconstruct a point from barycentric coordinates of a segment.
pub fn reconstruct_point_from_barycentric_segment(
    q0: &Point3,
    q1: &Point3,
    lambda: &[f64; 2],
) -> Point3 {
    add(&scaled(q0, lambda[0]), &scaled(q1, lambda[1]))
}

/// Reconstruct a point from barycentric coordinates of a triangle.
pub fn reconstruct_point_from_barycentric_triangle(
    q0: &Point3,
    q1: &Point3,
    q2: &Point3,
    lambda: &[f64; 3],
) -> Point3 {
    add(
        &add(&scaled(q0, lambda[0]), &scaled(q1, lambda[1])),
        &scaled(q2, lambda[2]),
    )
}

/// Reconstruct a point from barycentric coordinates of a convex polygon.
pub fn reconstruct_point_from_barycentric_simplex(
    vertices: &[Point3],
    lambda: &[f64],
) -> Point3 {
    debug_assert_eq!(vertices.len(), lambda.len());
    let mut point = [0.0; 3];
    for (vertex, &weight) in vertices.iter().zip(lambda) {
        point = add(&point, &scaled(vertex, weight));
    }
    point
}

/// Convert barycentric coordinates on a segment to a location flag:
/// 0 inside the segment, i on the i-th vertex.
pub fn convert_barycentric_to_flag_segment(lambda: &[f64; 2]) -> i32 {
    if lambda[0] >= 1.0 {
        1
    } else if lambda[1] >= 1.0 {
        2
    } else {
        0
    }
}

/// Convert barycentric coordinates on a triangle to a location flag:
/// 0 inside, +i on the i-th vertex, -i on the edge leaving the i-th
/// vertex towards the next one.
pub fn convert_barycentric_to_flag_triangle(lambda: &[f64; 3]) -> i32 {
    let mut count = 0;
    let mut zeros = [0usize; 2];

    for (i, &l) in lambda.iter().enumerate() {
        if l <= 0.0 {
            zeros[count] = i;
            count += 1;
        }
    }

    match count {
        1 => {
            let vertex0 = (zeros[0] + 1) % 3;
            -(vertex0 as i32 + 1)
        }
        2 => (3 - zeros[0] - zeros[1]) as i32 + 1,
        _ => 0,
    }
}

/// Convert barycentric coordinates on a convex polygon to a location flag:
/// 0 inside, +i on the i-th vertex, -i on the edge leaving the i-th vertex.
pub fn convert_barycentric_to_flag_simplex(lambda: &[f64]) -> i32 {
    let mut count = 0;
    let mut positives = [0usize; 3];

    for (i, &l) in lambda.iter().enumerate() {
        if l > 0.0 {
            if count < positives.len() {
                positives[count] = i;
            }
            count += 1;
        }
    }

    match count {
        1 => positives[0] as i32 + 1,
        2 => -(positives[0] as i32 + 2),
        _ => 0,
    }
}

// ------------------------------------------------------------------------
// Projections
// ------------------------------------------------------------------------

/// Project a point onto a line given by a point and a unit direction.
pub fn project_point_line(p: &Point3, q: &Point3, n: &Point3) -> Point3 {
    add(q, &scaled(n, dot_product(&sub(p, q), n)))
}

/// Project a point onto a plane given by a point and a unit normal.
pub fn project_point_plane(p: &Point3, q: &Point3, n: &Point3) -> Point3 {
    sub(p, &scaled(n, dot_product(&sub(p, q), n)))
}

/// Project a point onto a segment. Returns the clamped projection and its
/// barycentric coordinates.
pub fn project_point_segment(p: &Point3, q0: &Point3, q1: &Point3) -> (Point3, [f64; 2]) {
    let n = sub(q1, q0);
    let t = -dot_product(&n, &sub(q0, p)) / dot_product(&n, &n);

    // Restrict the projection onto the segment.
    let t = t.clamp(0.0, 1.0);

    let lambda = [1.0 - t, t];
    (
        reconstruct_point_from_barycentric_segment(q0, q1, &lambda),
        lambda,
    )
}

/// Restrict a point given in barycentric coordinates to the triangle:
/// with one negative coordinate the point projects onto the opposite
/// edge, with two it snaps to the remaining vertex. `lambda` is updated
/// in place.
pub fn restrict_point_triangle(
    q0: &Point3,
    q1: &Point3,
    q2: &Point3,
    lambda: &mut [f64; 3],
) -> Point3 {
    let vertices = [q0, q1, q2];

    let mut count = 0;
    let mut negatives = [0usize; 2];
    for (i, &l) in lambda.iter().enumerate() {
        if l < 0.0 {
            negatives[count] = i;
            count += 1;
        }
    }

    match count {
        0 => reconstruct_point_from_barycentric_triangle(q0, q1, q2, lambda),
        1 => {
            let vertex0 = (negatives[0] + 1) % 3;
            let vertex1 = (vertex0 + 1) % 3;
            let p = reconstruct_point_from_barycentric_triangle(q0, q1, q2, lambda);
            let (projection, local) =
                project_point_segment(&p, vertices[vertex0], vertices[vertex1]);
            lambda[negatives[0]] = 0.0;
            lambda[vertex0] = local[0];
            lambda[vertex1] = local[1];
            projection
        }
        _ => {
            let vertex0 = 3 - negatives[0] - negatives[1];
            *lambda = [0.0; 3];
            lambda[vertex0] = 1.0;
            *vertices[vertex0]
        }
    }
}

// Solve the 2x2 SPD Gram system of the triangle edge vectors for the
// planar coordinates of a point. The Gram matrix of a non-degenerate
// triangle is positive definite, so the determinant is positive.
fn triangle_plane_coordinates(
    p: &Point3,
    q0: &Point3,
    s0: &Point3,
    s1: &Point3,
) -> [f64; 3] {
    let a00 = dot_product(s0, s0);
    let a01 = dot_product(s0, s1);
    let a11 = dot_product(s1, s1);
    let det = a00 * a11 - a01 * a01;
    debug_assert!(det > 0.0);

    let r = sub(p, q0);
    let b0 = dot_product(s0, &r);
    let b1 = dot_product(s1, &r);

    let t0 = (b0 * a11 - b1 * a01) / det;
    let t1 = (b1 * a00 - b0 * a01) / det;

    [1.0 - t0 - t1, t0, t1]
}

/// Project a point onto a triangle. Returns the clamped projection and
/// its barycentric coordinates.
pub fn project_point_triangle(
    p: &Point3,
    q0: &Point3,
    q1: &Point3,
    q2: &Point3,
) -> (Point3, [f64; 3]) {
    let s0 = sub(q1, q0);
    let s1 = sub(q2, q0);
    let mut lambda = triangle_plane_coordinates(p, q0, &s0, &s1);
    let projection = restrict_point_triangle(q0, q1, q2, &mut lambda);
    (projection, lambda)
}

/// Project a cloud of points sharing one triangle. The flat buffer packs
/// the points as consecutive coordinate triples.
pub fn project_points_triangle(
    points: &[f64],
    q0: &Point3,
    q1: &Point3,
    q2: &Point3,
) -> (Vec<Point3>, Vec<[f64; 3]>) {
    assert_eq!(points.len() % 3, 0);
    let points: &[Point3] = bytemuck::cast_slice(points);

    // The Gram matrix is shared by the whole cloud.
    let s0 = sub(q1, q0);
    let s1 = sub(q2, q0);

    let mut projections = Vec::with_capacity(points.len());
    let mut lambdas = Vec::with_capacity(points.len());
    for point in points {
        let mut lambda = triangle_plane_coordinates(point, q0, &s0, &s1);
        projections.push(restrict_point_triangle(q0, q1, q2, &mut lambda));
        lambdas.push(lambda);
    }

    (projections, lambdas)
}

/// Project a point onto a convex polygon given as an ordered vertex list.
/// Reduces to the segment (n = 2) or triangle (n = 3) projection, and to
/// the minimum over the fan triangulation `(V0, Vi, Vi+1)` otherwise.
/// Returns the projection and its barycentric coordinates.
pub fn project_point_simplex(p: &Point3, vertices: &[Point3]) -> Result<(Point3, Vec<f64>)> {
    match vertices.len() {
        0 | 1 => Err(MeshError::InvalidArgument(format!(
            "simplex projection needs at least two vertices, got {}",
            vertices.len()
        ))),
        2 => {
            let (projection, lambda) = project_point_segment(p, &vertices[0], &vertices[1]);
            Ok((projection, lambda.to_vec()))
        }
        3 => {
            let (projection, lambda) =
                project_point_triangle(p, &vertices[0], &vertices[1], &vertices[2]);
            Ok((projection, lambda.to_vec()))
        }
        n => {
            let mut best_distance = f64::MAX;
            let mut best_projection = [0.0; 3];
            let mut best_lambda = vec![0.0; n];

            for i in 1..n - 1 {
                let (projection, lambda) =
                    project_point_triangle(p, &vertices[0], &vertices[i], &vertices[i + 1]);
                let distance = norm2(&sub(p, &projection));
                if distance < best_distance {
                    best_distance = distance;
                    best_projection = projection;
                    best_lambda.iter_mut().for_each(|l| *l = 0.0);
                    best_lambda[0] = lambda[0];
                    best_lambda[i] = lambda[1];
                    best_lambda[i + 1] = lambda[2];
                }
            }

            Ok((best_projection, best_lambda))
        }
    }
}

/// Project a point onto a cone given by apex, unit axis and half angle.
pub fn project_point_cone(point: &Point3, apex: &Point3, axis: &Point3, half_angle: f64) -> Point3 {
    let r = sub(point, apex);
    let height = dot_product(&r, axis);
    let radial = sub(&r, &scaled(axis, height));
    let radius = norm2(&radial);

    if radius <= DEFAULT_ABS_TOL {
        // On the axis the closest surface point is reached along any
        // generator; distance to the apex decides between apex and mantle.
        if height <= 0.0 {
            return *apex;
        }
        let slant = scaled(axis, height * half_angle.cos() * half_angle.cos());
        return add(apex, &slant);
    }

    let radial_dir = scaled(&radial, 1.0 / radius);
    // Unit vector along the nearest generator of the mantle.
    let generator = add(
        &scaled(axis, half_angle.cos()),
        &scaled(&radial_dir, half_angle.sin()),
    );
    let along = dot_product(&r, &generator).max(0.0);
    add(apex, &scaled(&generator, along))
}

// ------------------------------------------------------------------------
// Distances
// ------------------------------------------------------------------------

/// Distance of a point to a line given by a point and a unit direction.
pub fn distance_point_line(p: &Point3, q: &Point3, n: &Point3) -> f64 {
    norm2(&sub(&project_point_line(p, q, n), p))
}

/// Distance of a point to a plane given by a point and a unit normal.
pub fn distance_point_plane(p: &Point3, q: &Point3, n: &Point3) -> f64 {
    dot_product(&sub(p, q), n).abs()
}

/// Distance of a point to a segment.
pub fn distance_point_segment(p: &Point3, q0: &Point3, q1: &Point3) -> f64 {
    let (projection, _) = project_point_segment(p, q0, q1);
    norm2(&sub(&projection, p))
}

/// Distance of a point to a triangle.
pub fn distance_point_triangle(p: &Point3, q0: &Point3, q1: &Point3, q2: &Point3) -> f64 {
    let (projection, _) = project_point_triangle(p, q0, q1, q2);
    norm2(&sub(&projection, p))
}

/// Distance of a point to a convex polygon.
pub fn distance_point_simplex(p: &Point3, vertices: &[Point3]) -> Result<f64> {
    let (projection, _) = project_point_simplex(p, vertices)?;
    Ok(norm2(&sub(&projection, p)))
}

/// Distance of a point to a cone surface.
pub fn distance_point_cone(point: &Point3, apex: &Point3, axis: &Point3, half_angle: f64) -> f64 {
    let projection = project_point_cone(point, apex, axis, half_angle);
    norm2(&sub(&projection, point))
}

/// Distances of a cloud of points to one shared triangle. The flat buffer
/// packs the points as consecutive coordinate triples.
pub fn distance_cloud_triangle(
    points: &[f64],
    q0: &Point3,
    q1: &Point3,
    q2: &Point3,
) -> Vec<f64> {
    assert_eq!(points.len() % 3, 0);
    let cloud: &[Point3] = bytemuck::cast_slice(points);

    let (projections, _) = project_points_triangle(points, q0, q1, q2);
    cloud
        .iter()
        .zip(&projections)
        .map(|(point, projection)| norm2(&sub(projection, point)))
        .collect()
}

/// Distance between two lines, each given by a point and a unit direction.
pub fn distance_line_line(p0: &Point3, n0: &Point3, p1: &Point3, n1: &Point3) -> f64 {
    distance_line_line_closest_points(p0, n0, p1, n1).0
}

/// Distance between two lines together with the closest point on each.
pub fn distance_line_line_closest_points(
    p0: &Point3,
    n0: &Point3,
    p1: &Point3,
    n1: &Point3,
) -> (f64, Point3, Point3) {
    let n01 = dot_product(n0, n1);
    let det = 1.0 - n01 * n01;

    if det.abs() <= DEFAULT_ABS_TOL {
        // Parallel lines: any point of the first line realises the distance.
        let x1 = project_point_line(p0, p1, n1);
        return (norm2(&sub(&x1, p0)), *p0, x1);
    }

    let dp = sub(p1, p0);
    let b0 = dot_product(&dp, n0);
    let b1 = -dot_product(&dp, n1);

    let t0 = (b0 - n01 * b1) / det;
    let t1 = (b1 - n01 * b0) / det;

    let x0 = add(p0, &scaled(n0, t0));
    let x1 = add(p1, &scaled(n1, t1));
    (norm2(&sub(&x1, &x0)), x0, x1)
}

// ------------------------------------------------------------------------
// Intersections
// ------------------------------------------------------------------------

/// Intersection of two lines. `None` when the lines are skew or parallel.
pub fn intersect_line_line(p0: &Point3, n0: &Point3, p1: &Point3, n1: &Point3) -> Option<Point3> {
    let (distance, x0, _) = distance_line_line_closest_points(p0, n0, p1, n1);
    (distance < LINE_INTERSECTION_TOL).then_some(x0)
}

/// Intersection of two segments.
pub fn intersect_segment_segment(
    p0: &Point3,
    p1: &Point3,
    q0: &Point3,
    q1: &Point3,
) -> Option<Point3> {
    let np = sub(p1, p0);
    let lp = norm2(&np);
    let np = scaled(&np, 1.0 / lp);

    let nq = sub(q1, q0);
    let lq = norm2(&nq);
    let nq = scaled(&nq, 1.0 / lq);

    let x = intersect_line_line(p0, &np, q0, &nq)?;

    // The supporting lines intersect; keep the point only if it lies
    // inside both segments.
    let tp = dot_product(&sub(&x, p0), &np);
    let tq = dot_product(&sub(&x, q0), &nq);
    let inside = tp >= -DEFAULT_ABS_TOL
        && tp <= lp + DEFAULT_ABS_TOL
        && tq >= -DEFAULT_ABS_TOL
        && tq <= lq + DEFAULT_ABS_TOL;
    inside.then_some(x)
}

/// Intersection of a line and a plane. `None` when they are parallel.
pub fn intersect_line_plane(
    p0: &Point3,
    n0: &Point3,
    p1: &Point3,
    n1: &Point3,
) -> Option<Point3> {
    let s = dot_product(n0, n1);
    if s.abs() < DEFAULT_ABS_TOL {
        return None;
    }

    let xi = -dot_product(&sub(p0, p1), n1) / s;
    Some(add(p0, &scaled(n0, xi)))
}

/// Intersection of a segment and a plane.
pub fn intersect_segment_plane(
    q0: &Point3,
    q1: &Point3,
    p: &Point3,
    n: &Point3,
) -> Option<Point3> {
    let direction = normalized(&sub(q1, q0));
    let x = intersect_line_plane(q0, &direction, p, n)?;
    intersect_point_segment(&x, q0, q1).then_some(x)
}

/// Intersection line of two planes, returned as a point and a unit
/// direction. `None` when the planes are parallel.
pub fn intersect_plane_plane(
    p0: &Point3,
    n0: &Point3,
    p1: &Point3,
    n1: &Point3,
) -> Option<(Point3, Point3)> {
    let n01 = dot_product(n0, n1);
    let det = 1.0 - n01 * n01;
    if det.abs() <= DEFAULT_ABS_TOL {
        return None;
    }

    let direction = normalized(&cross_product(n0, n1));

    // Anchor the line at the point closest to both plane anchors; the
    // constrained minimisation reduces to a 2x2 Schur system in the two
    // Lagrange multipliers.
    let dp = sub(p1, p0);
    let rhs = [dot_product(n0, &dp), -dot_product(n1, &dp)];
    let lambda0 = (rhs[0] - n01 * rhs[1]) / det;
    let lambda1 = (rhs[1] - n01 * rhs[0]) / det;

    let mut anchor = add(p0, p1);
    anchor = sub(&anchor, &scaled(n0, lambda0));
    anchor = sub(&anchor, &scaled(n1, lambda1));
    anchor = scaled(&anchor, 0.5);

    Some((anchor, direction))
}

/// Intersection of a line and a triangle.
pub fn intersect_line_triangle(
    p: &Point3,
    n: &Point3,
    a: &Point3,
    b: &Point3,
    c: &Point3,
) -> Option<Point3> {
    let normal = normalized(&cross_product(&sub(b, a), &sub(c, a)));
    let x = intersect_line_plane(p, n, a, &normal)?;
    intersect_point_triangle(&x, a, b, c).then_some(x)
}

/// Intersection of a segment and a triangle.
pub fn intersect_segment_triangle(
    p0: &Point3,
    p1: &Point3,
    a: &Point3,
    b: &Point3,
    c: &Point3,
) -> Option<Point3> {
    let direction = normalized(&sub(p1, p0));
    let x = intersect_line_triangle(p0, &direction, a, b, c)?;
    intersect_point_segment(&x, p0, p1).then_some(x)
}

/// Intersection of a line and a convex polygon, resolved over the fan
/// triangulation.
pub fn intersect_line_simplex(p: &Point3, n: &Point3, vertices: &[Point3]) -> Option<Point3> {
    for i in 1..vertices.len().saturating_sub(1) {
        if let Some(x) = intersect_line_triangle(p, n, &vertices[0], &vertices[i], &vertices[i + 1])
        {
            return Some(x);
        }
    }
    None
}

/// Intersection of a segment and a convex polygon, resolved over the fan
/// triangulation.
pub fn intersect_segment_simplex(
    p0: &Point3,
    p1: &Point3,
    vertices: &[Point3],
) -> Option<Point3> {
    for i in 1..vertices.len().saturating_sub(1) {
        if let Some(x) =
            intersect_segment_triangle(p0, p1, &vertices[0], &vertices[i], &vertices[i + 1])
        {
            return Some(x);
        }
    }
    None
}

/// True if the point lies on the segment within the baseline tolerance.
pub fn intersect_point_segment(p: &Point3, q0: &Point3, q1: &Point3) -> bool {
    distance_point_segment(p, q0, q1) <= DEFAULT_ABS_TOL
}

/// True if the point lies on the triangle within the baseline tolerance.
pub fn intersect_point_triangle(p: &Point3, a: &Point3, b: &Point3, c: &Point3) -> bool {
    distance_point_triangle(p, a, b, c) <= DEFAULT_ABS_TOL
}

/// True if the point lies inside the box, checked on the first `dim` axes.
pub fn intersect_point_box(p: &Point3, a0: &Point3, a1: &Point3, dim: usize) -> bool {
    (0..dim).all(|d| p[d] >= a0[d] && p[d] <= a1[d])
}

// ------------------------------------------------------------------------
// Axis-aligned bounding boxes
// ------------------------------------------------------------------------

/// The axis-aligned bounding box of a segment.
pub fn compute_aabb_segment(q0: &Point3, q1: &Point3) -> (Point3, Point3) {
    let mut low = *q0;
    let mut high = *q0;
    for d in 0..3 {
        low[d] = low[d].min(q1[d]);
        high[d] = high[d].max(q1[d]);
    }
    (low, high)
}

/// The axis-aligned bounding box of a triangle.
pub fn compute_aabb_triangle(a: &Point3, b: &Point3, c: &Point3) -> (Point3, Point3) {
    compute_aabb_simplex(&[*a, *b, *c]).expect("three vertices given")
}

/// The axis-aligned bounding box of a vertex list.
pub fn compute_aabb_simplex(vertices: &[Point3]) -> Result<(Point3, Point3)> {
    let (first, rest) = vertices.split_first().ok_or_else(|| {
        MeshError::InvalidArgument("bounding box of an empty vertex list".to_string())
    })?;

    let mut low = *first;
    let mut high = *first;
    for vertex in rest {
        for d in 0..3 {
            low[d] = low[d].min(vertex[d]);
            high[d] = high[d].max(vertex[d]);
        }
    }
    Ok((low, high))
}

/// The union of two axis-aligned boxes.
pub fn union_aabb(a0: &Point3, a1: &Point3, b0: &Point3, b1: &Point3) -> (Point3, Point3) {
    let mut low = *a0;
    let mut high = *a1;
    for d in 0..3 {
        low[d] = low[d].min(b0[d]);
        high[d] = high[d].max(b1[d]);
    }
    (low, high)
}

/// The intersection of two axis-aligned boxes, `None` when they do not
/// overlap.
pub fn intersection_aabb(
    a0: &Point3,
    a1: &Point3,
    b0: &Point3,
    b1: &Point3,
) -> Option<(Point3, Point3)> {
    let mut low = [0.0; 3];
    let mut high = [0.0; 3];
    for d in 0..3 {
        if b0[d] > a1[d] || b1[d] < a0[d] {
            return None;
        }
        low[d] = a0[d].max(b0[d]);
        high[d] = a1[d].min(b1[d]);
    }
    Some((low, high))
}

/// The relative complement `B \ A` of two axis-aligned boxes, as the
/// per-axis clamp of `B` to the complement of `A`. The clamp along an
/// axis applies only when `A` covers `B` on every other axis, otherwise
/// `B` is returned unchanged.
pub fn subtraction_aabb(a0: &Point3, a1: &Point3, b0: &Point3, b1: &Point3) -> (Point3, Point3) {
    let mut low = *b0;
    let mut high = *b1;

    for d in 0..3 {
        let covers_others =
            (0..3).all(|e| e == d || (a0[e] <= b0[e] && b1[e] <= a1[e]));
        if !covers_others {
            continue;
        }

        if a0[d] <= b0[d] && a1[d] > b0[d] {
            low[d] = a1[d].min(b1[d]);
        }
        if a1[d] >= b1[d] && a0[d] < b1[d] {
            high[d] = a0[d].max(low[d]);
        }
    }

    (low, high)
}

/// True if two axis-aligned boxes overlap, checked on the first `dim`
/// axes.
pub fn intersect_box_box(a0: &Point3, a1: &Point3, b0: &Point3, b1: &Point3, dim: usize) -> bool {
    (0..dim).all(|d| b0[d] <= a1[d] && b1[d] >= a0[d])
}

/// The i-th vertex of a box, corners in z-order.
pub fn vertex_of_box(i: usize, a0: &Point3, a1: &Point3) -> Point3 {
    [
        if i & 1 == 0 { a0[0] } else { a1[0] },
        if (i >> 1) & 1 == 0 { a0[1] } else { a1[1] },
        if (i >> 2) & 1 == 0 { a0[2] } else { a1[2] },
    ]
}

/// The i-th edge of a box as a segment.
pub fn edge_of_box(i: usize, a0: &Point3, a1: &Point3) -> (Point3, Point3) {
    let [v0, v1] = crate::constants::EDGE_NODES_3D[i];
    (vertex_of_box(v0, a0, a1), vertex_of_box(v1, a0, a1))
}

/// The i-th face of a box as a four-vertex loop.
pub fn face_of_box(i: usize, a0: &Point3, a1: &Point3) -> [Point3; 4] {
    let nodes = crate::constants::FACE_NODES_3D[i];
    // The face tables list corners in z-order; swap the last two to get a
    // cyclic loop.
    [
        vertex_of_box(nodes[0], a0, a1),
        vertex_of_box(nodes[1], a0, a1),
        vertex_of_box(nodes[3], a0, a1),
        vertex_of_box(nodes[2], a0, a1),
    ]
}

/// True if a box and a triangle intersect.
pub fn intersect_box_triangle(
    a0: &Point3,
    a1: &Point3,
    v0: &Point3,
    v1: &Point3,
    v2: &Point3,
) -> bool {
    // Bounding boxes must overlap.
    let (b0, b1) = compute_aabb_triangle(v0, v1, v2);
    if !intersect_box_box(a0, a1, &b0, &b1, 3) {
        return false;
    }

    // A triangle vertex inside the box settles containment.
    for vertex in [v0, v1, v2] {
        if intersect_point_box(vertex, a0, a1, 3) {
            return true;
        }
    }

    // Otherwise some box edge must pierce the triangle.
    (0..12).any(|i| {
        let (e0, e1) = edge_of_box(i, a0, a1);
        intersect_segment_triangle(&e0, &e1, v0, v1, v2).is_some()
    })
}

/// Intersection points between the edges of a box and a triangle. Returns
/// `None` when box and triangle do not intersect; a contained triangle
/// yields an empty point list.
pub fn intersect_box_triangle_points(
    a0: &Point3,
    a1: &Point3,
    v0: &Point3,
    v1: &Point3,
    v2: &Point3,
) -> Option<Vec<Point3>> {
    if !intersect_box_triangle(a0, a1, v0, v1, v2) {
        return None;
    }

    let mut points = Vec::with_capacity(3);
    for i in 0..12 {
        let (e0, e1) = edge_of_box(i, a0, a1);
        if let Some(x) = intersect_segment_triangle(&e0, &e1, v0, v1, v2) {
            points.push(x);
        }
    }
    Some(points)
}

/// True if a segment and a box intersect, checked on the first `dim`
/// axes.
pub fn intersect_segment_box(
    p0: &Point3,
    p1: &Point3,
    a0: &Point3,
    a1: &Point3,
    dim: usize,
) -> bool {
    let (b0, b1) = compute_aabb_segment(p0, p1);
    if !intersect_box_box(a0, a1, &b0, &b1, dim) {
        return false;
    }

    // An endpoint inside the box settles containment.
    if intersect_point_box(p0, a0, a1, dim) || intersect_point_box(p1, a0, a1, dim) {
        return true;
    }

    if dim == 2 {
        // Drop the third component and test the four rectangle edges in
        // the plane.
        let q0 = [p0[0], p0[1], 0.0];
        let q1 = [p1[0], p1[1], 0.0];
        let corners = [
            [a0[0], a0[1], 0.0],
            [a1[0], a0[1], 0.0],
            [a1[0], a1[1], 0.0],
            [a0[0], a1[1], 0.0],
        ];
        for i in 0..4 {
            if intersect_segment_segment(&q0, &q1, &corners[i], &corners[(i + 1) % 4]).is_some() {
                return true;
            }
        }
        false
    } else {
        // Test the six faces of the box.
        (0..6).any(|i| {
            let face = face_of_box(i, a0, a1);
            intersect_segment_simplex(p0, p1, &face).is_some()
        })
    }
}

/// True if a box and a convex polygon intersect, checked on the first
/// `dim` axes.
pub fn intersect_box_simplex(
    a0: &Point3,
    a1: &Point3,
    vertices: &[Point3],
    dim: usize,
) -> Result<bool> {
    let (b0, b1) = compute_aabb_simplex(vertices)?;
    if !intersect_box_box(a0, a1, &b0, &b1, dim) {
        return Ok(false);
    }

    if vertices
        .iter()
        .any(|vertex| intersect_point_box(vertex, a0, a1, dim))
    {
        return Ok(true);
    }

    match vertices.len() {
        1 => Ok(false),
        2 => Ok(intersect_segment_box(&vertices[0], &vertices[1], a0, a1, dim)),
        _ => {
            if dim == 2 {
                // In the plane it is enough to test the polygon boundary
                // against the rectangle.
                for i in 0..vertices.len() {
                    let next = (i + 1) % vertices.len();
                    if intersect_segment_box(&vertices[i], &vertices[next], a0, a1, 2) {
                        return Ok(true);
                    }
                }
                Ok(false)
            } else {
                Ok((1..vertices.len() - 1).any(|i| {
                    intersect_box_triangle(a0, a1, &vertices[0], &vertices[i], &vertices[i + 1])
                }))
            }
        }
    }
}

// ------------------------------------------------------------------------
// Physical boxes
// ------------------------------------------------------------------------

/// A bounding box describing the geometry an octree lives in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhysicalBox {
    coords: [f64; 6],
}

impl PhysicalBox {
    /// Create a new bounding box.
    ///
    /// The coordinates are given by `[xmin, ymin, zmin, xmax, ymax, zmax]`.
    pub fn new(coords: [f64; 6]) -> Self {
        Self { coords }
    }

    /// The axis-aligned bounding box of a flat point buffer.
    pub fn from_points(points: &[f64]) -> PhysicalBox {
        assert_eq!(points.len() % 3, 0);
        let points: &[Point3] = bytemuck::cast_slice(points);

        let mut low = [f64::MAX; 3];
        let mut high = [f64::MIN; 3];
        for point in points {
            for d in 0..3 {
                low[d] = low[d].min(point[d]);
                high[d] = high[d].max(point[d]);
            }
        }

        PhysicalBox {
            coords: [low[0], low[1], low[2], high[0], high[1], high[2]],
        }
    }

    /// Return the coordinates as `[xmin, ymin, zmin, xmax, ymax, zmax]`.
    pub fn coordinates(&self) -> [f64; 6] {
        self.coords
    }

    /// Map a point from the reference box `[0, 1]^3` to the bounding box.
    pub fn reference_to_physical(&self, point: Point3) -> Point3 {
        let [xmin, ymin, zmin, xmax, ymax, zmax] = self.coords;

        [
            xmin + (xmax - xmin) * point[0],
            ymin + (ymax - ymin) * point[1],
            zmin + (zmax - zmin) * point[2],
        ]
    }

    /// Map a point from the physical domain to the reference box.
    pub fn physical_to_reference(&self, point: Point3) -> Point3 {
        let [xmin, ymin, zmin, xmax, ymax, zmax] = self.coords;

        [
            (point[0] - xmin) / (xmax - xmin),
            (point[1] - ymin) / (ymax - ymin),
            (point[2] - zmin) / (zmax - zmin),
        ]
    }

    /// True if the point lies in the closed box inflated by `tol`.
    pub fn contains(&self, point: &Point3, tol: f64) -> bool {
        let [xmin, ymin, zmin, xmax, ymax, zmax] = self.coords;
        point[0] >= xmin - tol
            && point[0] <= xmax + tol
            && point[1] >= ymin - tol
            && point[1] <= ymax + tol
            && point[2] >= zmin - tol
            && point[2] <= zmax + tol
    }

    /// Return an ordered list of corners of the box, in z-order.
    pub fn corners(&self) -> [Point3; 8] {
        let [xmin, ymin, zmin, xmax, ymax, zmax] = self.coords;
        std::array::from_fn(|i| vertex_of_box(i, &[xmin, ymin, zmin], &[xmax, ymax, zmax]))
    }
}

impl std::fmt::Display for PhysicalBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [xmin, ymin, zmin, xmax, ymax, zmax] = self.coords;

        write!(
            f,
            "(xmin: {}, ymin: {}, zmin: {}, xmax: {}, ymax: {}, zmax: {})",
            xmin, ymin, zmin, xmax, ymax, zmax
        )
    }
}
