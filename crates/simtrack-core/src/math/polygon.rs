use nalgebra::Point2;

use super::similarity::Similarity2;

/// Corners of the axis-aligned rectangle `[0,w] × [0,h]` mapped through
/// `model`, in counter-clockwise order.
pub fn rect_corners(model: &Similarity2, width: f64, height: f64) -> Vec<Point2<f64>> {
    [
        Point2::new(0.0, 0.0),
        Point2::new(width, 0.0),
        Point2::new(width, height),
        Point2::new(0.0, height),
    ]
    .iter()
    .map(|p| model.transform_point(p))
    .collect()
}

/// Signed polygon area via the trapezoidal shoelace sum. Positive for
/// counter-clockwise winding.
pub fn polygon_area(polygon: &[Point2<f64>]) -> f64 {
    if polygon.len() < 3 {
        return 0.0;
    }
    let mut sum = 0.0;
    for (i, p) in polygon.iter().enumerate() {
        let q = &polygon[(i + 1) % polygon.len()];
        sum += (q.x - p.x) * (q.y + p.y);
    }
    -0.5 * sum
}

/// Clips the convex polygon `subject` against the convex polygon `clip`
/// (Sutherland-Hodgman). Both must wind counter-clockwise. Returns the
/// intersection polygon, possibly empty.
pub fn clip_convex(subject: &[Point2<f64>], clip: &[Point2<f64>]) -> Vec<Point2<f64>> {
    let mut output: Vec<Point2<f64>> = subject.to_vec();

    for (i, a) in clip.iter().enumerate() {
        if output.is_empty() {
            break;
        }
        let b = &clip[(i + 1) % clip.len()];
        let input = std::mem::take(&mut output);

        for (j, p) in input.iter().enumerate() {
            let q = &input[(j + 1) % input.len()];
            let p_inside = is_left(a, b, p);
            let q_inside = is_left(a, b, q);

            if p_inside {
                output.push(*p);
                if !q_inside {
                    if let Some(x) = segment_line_intersection(p, q, a, b) {
                        output.push(x);
                    }
                }
            } else if q_inside {
                if let Some(x) = segment_line_intersection(p, q, a, b) {
                    output.push(x);
                }
            }
        }
    }

    output
}

fn is_left(a: &Point2<f64>, b: &Point2<f64>, p: &Point2<f64>) -> bool {
    (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x) >= 0.0
}

fn segment_line_intersection(
    p: &Point2<f64>,
    q: &Point2<f64>,
    a: &Point2<f64>,
    b: &Point2<f64>,
) -> Option<Point2<f64>> {
    let d1 = q - p;
    let d2 = b - a;
    let denom = d1.x * d2.y - d1.y * d2.x;
    if denom.abs() < 1e-12 {
        return None;
    }
    let t = ((a.x - p.x) * d2.y - (a.y - p.y) * d2.x) / denom;
    Some(Point2::new(p.x + t * d1.x, p.y + t * d1.y))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector2;

    fn unit_square() -> Vec<Point2<f64>> {
        rect_corners(&Similarity2::identity(), 1.0, 1.0)
    }

    #[test]
    fn area_of_unit_square() {
        assert_relative_eq!(polygon_area(&unit_square()), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn self_clip_is_identity() {
        let square = unit_square();
        let clipped = clip_convex(&square, &square);
        assert_relative_eq!(polygon_area(&clipped), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn shifted_square_overlap() {
        let square = unit_square();
        let shifted = rect_corners(
            &Similarity2::new(1.0, 0.0, Vector2::new(0.5, 0.5)),
            1.0,
            1.0,
        );
        let overlap = clip_convex(&shifted, &square);
        assert_relative_eq!(polygon_area(&overlap), 0.25, epsilon = 1e-9);
    }

    #[test]
    fn disjoint_polygons_clip_to_nothing() {
        let square = unit_square();
        let far = rect_corners(
            &Similarity2::new(1.0, 0.0, Vector2::new(5.0, 5.0)),
            1.0,
            1.0,
        );
        let overlap = clip_convex(&far, &square);
        assert!(polygon_area(&overlap).abs() < 1e-9);
    }

    #[test]
    fn rotated_rect_keeps_area() {
        let rotated = rect_corners(
            &Similarity2::new(1.0, 0.3, Vector2::new(0.0, 0.0)),
            2.0,
            3.0,
        );
        assert_relative_eq!(polygon_area(&rotated), 6.0, epsilon = 1e-9);
    }
}
