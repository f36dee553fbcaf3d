pub mod sma;
pub mod welford;
