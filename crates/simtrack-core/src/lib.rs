//! Core algorithms for incremental 2D similarity-motion tracking: robust
//! pairwise estimation, window/key-frame management, and windowed bundle
//! adjustment over a correspondence graph.

pub mod estimate;
pub mod math;
pub mod solve;
pub mod window;
