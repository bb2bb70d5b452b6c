pub mod devices;
pub mod models;
pub mod settings;
pub mod transfer;
