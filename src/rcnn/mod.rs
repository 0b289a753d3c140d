pub mod bbox;
pub mod box_coder;
pub mod matcher;
pub mod sampler;
