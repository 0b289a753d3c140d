pub mod bbox_regression;
pub mod loss;
pub mod nms;
pub mod postprocess;
