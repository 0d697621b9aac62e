//! rtiview - multiresolution tile streaming for RTI viewers

pub mod core;
pub mod math;
pub mod mesh;
pub mod multires;
pub mod streaming;
