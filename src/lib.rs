pub mod config;
pub mod errors;
pub mod integrations;
pub mod scan;
