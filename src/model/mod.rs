pub mod bucket;
pub mod candle;
pub mod duration;
pub mod tick;
