pub mod config;
pub mod detection_head;
pub mod input_adapter;
pub mod predictor;
pub mod roi_heads;
pub mod targets;
