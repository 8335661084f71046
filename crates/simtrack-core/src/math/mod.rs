pub mod polygon;
pub mod similarity;

pub use polygon::{clip_convex, polygon_area, rect_corners};
pub use similarity::{rotate, Similarity2};
