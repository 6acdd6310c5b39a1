pub mod document;
pub mod reload;
pub mod store;
