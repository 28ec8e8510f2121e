//! Geometry utilities: SE3 transforms, PnP solving, two-view reconstruction.

pub mod pnp;
pub mod se3;
pub mod two_view;

pub use pnp::{PnPResult, PnpParams, solve_pnp_ransac};
pub use se3::SE3;
pub use two_view::{TwoViewParams, TwoViewReconstruction, projection_matrix, triangulate};
