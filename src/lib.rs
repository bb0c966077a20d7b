//! Read HPW heat pump water heaters over Modbus and republish their setpoints.

pub mod catalog;
pub mod commands;
pub mod connection;
pub mod decode;
pub mod http;
pub mod modbus;
pub mod output;
pub mod profile;
pub mod ranges;
pub mod snapshot;
