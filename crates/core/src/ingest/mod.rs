pub mod source;
pub mod tradingview;
pub mod types;
