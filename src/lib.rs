pub mod cache;
pub mod config;
#[macro_use]
pub mod error;
pub mod ec2;
pub mod http;
pub mod lookup;
pub mod resolver;
pub mod store;
pub mod template;
