pub mod shipping;
pub mod webhooks;
