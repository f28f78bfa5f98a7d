pub mod shipping;
pub mod store;
