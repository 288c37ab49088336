pub mod event;
pub mod segmentation;
pub mod similarity;
pub mod text;
pub mod unit;
