//! Mathematical utilities and data structures

pub mod aabb;
pub mod morton;
pub mod frustum;

pub use aabb::Aabb;
pub use frustum::{Plane, Frustum};
