pub mod config;
pub mod controller;
pub mod device;
pub mod modbus;

pub use config::*;
pub use controller::*;
pub use device::*;
