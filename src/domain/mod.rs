pub mod error;
pub mod fleet_service;
pub mod lifecycle;
pub mod node;
pub mod registry;
pub mod types;
pub mod validate;
