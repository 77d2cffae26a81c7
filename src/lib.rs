pub mod config;
pub mod constants;
pub mod control;
pub mod modbus;
pub mod registry;
pub mod rules;
