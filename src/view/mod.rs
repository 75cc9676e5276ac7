pub mod bounds;
pub mod conical;
pub mod frustum;

pub use bounds::{AABox, AACube, BoundingVolume};
pub use conical::{ConicalFrustumError, ConicalView, ConicalViewFrustum};
pub use frustum::ViewFrustum;
