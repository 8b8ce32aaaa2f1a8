pub mod config;
pub mod consent;
pub mod extract;
pub mod lock;
pub mod model;
pub mod notify;
pub mod pipeline;
pub mod render;
pub mod store;
