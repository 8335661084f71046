use nalgebra::{Point2, Vector2};

use crate::math::similarity::Similarity2;

/// One tracked point and its motion relative to a matched frame.
#[derive(Debug, Clone, Copy)]
pub struct FeatureCorrespondence {
    /// Position in the current frame.
    pub location: Point2<f64>,
    /// Motion vector towards the matched frame.
    pub displacement: Vector2<f64>,
    pub weight: f64,
}

impl FeatureCorrespondence {
    pub fn new(location: Point2<f64>, displacement: Vector2<f64>, weight: f64) -> Self {
        Self {
            location,
            displacement,
            weight,
        }
    }

    /// Position of the correspondence in the matched frame.
    pub fn matched_location(&self) -> Point2<f64> {
        self.location + self.displacement
    }
}

/// Aggregated motion of all tracked points inside one segmented region,
/// produced by the upstream region/optical-flow tracker.
#[derive(Debug, Clone)]
pub struct RegionCorrespondence {
    pub region_id: u32,
    pub features: Vec<FeatureCorrespondence>,
    /// Mean displacement over the region's features.
    pub mean_vector: Vector2<f64>,
    /// Representative point for the region (feature centroid).
    pub anchor_point: Point2<f64>,
    /// Feature with the smallest displacement magnitude, if any.
    pub min_magnitude_match: Option<FeatureCorrespondence>,
    /// Feature with the largest displacement magnitude, if any.
    pub max_magnitude_match: Option<FeatureCorrespondence>,
}

impl RegionCorrespondence {
    /// Builds a region correspondence, deriving the aggregate fields from
    /// the feature list. An empty feature list yields zero aggregates.
    pub fn from_features(region_id: u32, features: Vec<FeatureCorrespondence>) -> Self {
        if features.is_empty() {
            return Self {
                region_id,
                features,
                mean_vector: Vector2::zeros(),
                anchor_point: Point2::origin(),
                min_magnitude_match: None,
                max_magnitude_match: None,
            };
        }

        let inv_len = 1.0 / features.len() as f64;
        let mean_vector = features
            .iter()
            .fold(Vector2::zeros(), |acc, f| acc + f.displacement)
            * inv_len;
        let anchor_point = Point2::from(
            features
                .iter()
                .fold(Vector2::zeros(), |acc, f| acc + f.location.coords)
                * inv_len,
        );

        let mut min = features[0];
        let mut max = features[0];
        for f in &features[1..] {
            if f.displacement.norm() < min.displacement.norm() {
                min = *f;
            }
            if f.displacement.norm() > max.displacement.norm() {
                max = *f;
            }
        }

        Self {
            region_id,
            features,
            mean_vector,
            anchor_point,
            min_magnitude_match: Some(min),
            max_magnitude_match: Some(max),
        }
    }
}

/// Result of one robust pairwise estimation: the fitted model together with
/// the inlier/outlier partition of the regions that produced it. Immutable
/// after creation; the window manager may only drop it wholesale.
#[derive(Debug, Clone)]
pub struct FrameMatch {
    pub model: Similarity2,
    /// How many frames back the matched frame lies.
    pub matched_frame_offset: usize,
    pub inlier_regions: Vec<u32>,
    pub outlier_regions: Vec<u32>,
    /// Normalized residual-to-threshold score per inlier region, aligned
    /// with `inlier_regions` (1.0 = perfect agreement).
    pub inlier_scores: Vec<f64>,
    /// Point pairs used by the final closed-form fit.
    pub point_pair_count: usize,
    /// The region data the estimate was computed from, kept for the
    /// bundle-adjustment graph.
    pub regions: Vec<RegionCorrespondence>,
}

impl FrameMatch {
    /// An identity match carrying the region data, used when estimation
    /// fails recoverably.
    pub fn identity(matched_frame_offset: usize, regions: Vec<RegionCorrespondence>) -> Self {
        Self {
            model: Similarity2::identity(),
            matched_frame_offset,
            inlier_regions: Vec::new(),
            outlier_regions: Vec::new(),
            inlier_scores: Vec::new(),
            point_pair_count: 0,
            regions,
        }
    }
}
