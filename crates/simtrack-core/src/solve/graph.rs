use nalgebra::Point2;

use crate::estimate::FrameMatch;

/// One weighted point correspondence between two window frames.
#[derive(Debug, Clone, Copy)]
pub struct PointPair {
    /// Location in the current frame.
    pub current: Point2<f64>,
    /// Observed location in the matched frame.
    pub matched: Point2<f64>,
    pub weight: f64,
}

/// All point pairs one frame shares with one matched frame.
#[derive(Debug, Clone)]
pub struct GraphEdge {
    pub matched_index: usize,
    pub pairs: Vec<PointPair>,
}

/// Arena of correspondence edges indexed by window frame, built once per
/// window and reused across every robustification round.
///
/// Edges run in the forward direction only (frame `i` towards an earlier
/// matched frame `j`); no symmetric reverse edge is emitted.
#[derive(Debug, Clone)]
pub struct CorrespondenceGraph {
    edges: Vec<Vec<GraphEdge>>,
}

impl CorrespondenceGraph {
    /// An empty graph over `num_frames` frames (frame 0 is the key frame).
    pub fn new(num_frames: usize) -> Self {
        Self {
            edges: vec![Vec::new(); num_frames],
        }
    }

    /// Builds the graph from a closed window. Each inlier region contributes
    /// up to three representative pairs (the anchor point displaced by the
    /// region mean plus the min- and max-magnitude matches), keeping the
    /// problem small regardless of raw feature counts.
    pub fn from_window(frames: &[Vec<FrameMatch>]) -> Self {
        let mut graph = Self::new(frames.len() + 1);

        for (pos, matches) in frames.iter().enumerate() {
            let frame_index = pos + 1;
            for frame_match in matches {
                if frame_match.matched_frame_offset > frame_index {
                    // Match reaches past the key frame; outside this window.
                    continue;
                }
                let matched_index = frame_index - frame_match.matched_frame_offset;
                let pairs = representative_pairs(frame_match);
                if !pairs.is_empty() {
                    graph.add_edge(frame_index, GraphEdge { matched_index, pairs });
                }
            }
        }

        graph
    }

    pub fn add_edge(&mut self, frame_index: usize, edge: GraphEdge) {
        self.edges[frame_index].push(edge);
    }

    pub fn num_frames(&self) -> usize {
        self.edges.len()
    }

    pub fn edges(&self, frame_index: usize) -> &[GraphEdge] {
        &self.edges[frame_index]
    }

    pub fn total_pairs(&self) -> usize {
        self.edges
            .iter()
            .flatten()
            .map(|edge| edge.pairs.len())
            .sum()
    }
}

fn representative_pairs(frame_match: &FrameMatch) -> Vec<PointPair> {
    let mut pairs = Vec::new();
    for region in &frame_match.regions {
        let Some(slot) = frame_match
            .inlier_regions
            .iter()
            .position(|&id| id == region.region_id)
        else {
            continue;
        };
        let region_weight = frame_match.inlier_scores.get(slot).copied().unwrap_or(1.0);

        pairs.push(PointPair {
            current: region.anchor_point,
            matched: region.anchor_point + region.mean_vector,
            weight: region_weight.max(f64::EPSILON),
        });
        for feature in [&region.min_magnitude_match, &region.max_magnitude_match]
            .into_iter()
            .flatten()
        {
            pairs.push(PointPair {
                current: feature.location,
                matched: feature.matched_location(),
                weight: feature.weight,
            });
        }
    }
    pairs
}
