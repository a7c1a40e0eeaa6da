pub mod agent;
pub mod config;
pub mod enhance;
pub mod model;
pub mod perturb;
pub mod publish;
pub mod rewrite;
pub mod source;
pub mod store;
