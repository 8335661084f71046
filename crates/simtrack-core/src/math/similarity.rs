use nalgebra::{Matrix2, Point2, Vector2};

/// Rotates a 2D vector by `angle` radians (counter-clockwise).
pub fn rotate(angle: f64, v: &Vector2<f64>) -> Vector2<f64> {
    let (sin, cos) = angle.sin_cos();
    Vector2::new(cos * v.x - sin * v.y, sin * v.x + cos * v.y)
}

/// A 2D similarity transform `x ↦ scale · R(rotation) · x + translation`.
///
/// Forms a group under [`Similarity2::concat`] with apply-then-apply
/// semantics: `(a.concat(b))(x) == a(b(x))`. Callers guarantee
/// `scale > 0`; no clamping is performed here, a degenerate fit must be
/// rejected before it is stored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity2 {
    pub scale: f64,
    pub rotation: f64,
    pub translation: Vector2<f64>,
}

impl Similarity2 {
    pub fn new(scale: f64, rotation: f64, translation: Vector2<f64>) -> Self {
        Self {
            scale,
            rotation,
            translation,
        }
    }

    /// Returns the identity transform.
    pub fn identity() -> Self {
        Self::new(1.0, 0.0, Vector2::zeros())
    }

    /// Composes two transforms so that `a.concat(b)` applies `b` first.
    pub fn concat(&self, other: &Self) -> Self {
        Self {
            scale: self.scale * other.scale,
            rotation: self.rotation + other.rotation,
            translation: self.scale * rotate(self.rotation, &other.translation)
                + self.translation,
        }
    }

    /// Returns the exact algebraic inverse.
    pub fn inverse(&self) -> Self {
        let inv_scale = 1.0 / self.scale;
        Self {
            scale: inv_scale,
            rotation: -self.rotation,
            translation: -inv_scale * rotate(-self.rotation, &self.translation),
        }
    }

    pub fn transform_point(&self, p: &Point2<f64>) -> Point2<f64> {
        Point2::from(self.scale * rotate(self.rotation, &p.coords) + self.translation)
    }

    /// Applies the linear part only (no translation).
    pub fn transform_vector(&self, v: &Vector2<f64>) -> Vector2<f64> {
        self.scale * rotate(self.rotation, v)
    }

    /// The 2x2 linear part `scale · R(rotation)`.
    pub fn linear(&self) -> Matrix2<f64> {
        let (sin, cos) = self.rotation.sin_cos();
        self.scale * Matrix2::new(cos, -sin, sin, cos)
    }
}

impl Default for Similarity2 {
    fn default() -> Self {
        Self::identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample() -> (Similarity2, Similarity2, Similarity2) {
        (
            Similarity2::new(1.2, 0.3, Vector2::new(4.0, -2.0)),
            Similarity2::new(0.8, -0.7, Vector2::new(-1.5, 6.0)),
            Similarity2::new(2.5, 1.1, Vector2::new(0.25, 0.5)),
        )
    }

    #[test]
    fn identity_is_neutral() {
        let (a, _, _) = sample();
        let id = Similarity2::identity();
        let p = Point2::new(3.0, -7.0);

        assert_relative_eq!(
            a.concat(&id).transform_point(&p),
            a.transform_point(&p),
            epsilon = 1e-12
        );
        assert_relative_eq!(
            id.concat(&a).transform_point(&p),
            a.transform_point(&p),
            epsilon = 1e-12
        );
    }

    #[test]
    fn concat_applies_right_operand_first() {
        let (a, b, _) = sample();
        let p = Point2::new(-2.0, 9.0);

        let composed = a.concat(&b).transform_point(&p);
        let chained = a.transform_point(&b.transform_point(&p));
        assert_relative_eq!(composed, chained, epsilon = 1e-12);
    }

    #[test]
    fn concat_is_associative() {
        let (a, b, c) = sample();
        let p = Point2::new(1.0, 1.0);

        let left = a.concat(&b).concat(&c).transform_point(&p);
        let right = a.concat(&b.concat(&c)).transform_point(&p);
        assert_relative_eq!(left, right, epsilon = 1e-9);
    }

    #[test]
    fn inverse_cancels_both_ways() {
        let (a, _, _) = sample();
        let id = Similarity2::identity();

        let fwd = a.concat(&a.inverse());
        let bwd = a.inverse().concat(&a);
        for m in [fwd, bwd] {
            assert_relative_eq!(m.scale, id.scale, epsilon = 1e-12);
            assert_relative_eq!(m.rotation, id.rotation, epsilon = 1e-12);
            assert_relative_eq!(m.translation, id.translation, epsilon = 1e-10);
        }
    }

    #[test]
    fn rotate_quarter_turn() {
        let v = Vector2::new(1.0, 0.0);
        let r = rotate(std::f64::consts::FRAC_PI_2, &v);
        assert_relative_eq!(r, Vector2::new(0.0, 1.0), epsilon = 1e-12);
    }
}
