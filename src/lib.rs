pub mod background;
pub mod device_endpoint;
pub mod meter_service;
pub mod modbus;
pub mod pool;
pub mod sentron;
pub mod settings;
pub mod simulator;

pub use device_endpoint::*;
pub use meter_service::*;
pub use pool::{ConnectionPool, Lease, PoolConfig};
pub use settings::GatewaySettings;
