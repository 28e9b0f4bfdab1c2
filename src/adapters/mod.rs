pub mod api;
pub mod directory_db;
pub mod fusion_solar;
pub mod solis_cloud;
pub mod vendor_client;
pub mod vendor_replay;
