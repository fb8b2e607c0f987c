//! E-prescribing gateway boundary: the capability trait, its wire types,
//! the HTTP adapter and a concurrency throttle.

pub mod gateway;
pub mod http;
pub mod throttle;
pub mod types;

pub use gateway::{ErxGateway, GatewayError};
pub use http::HttpErxGateway;
pub use throttle::ThrottledGateway;
pub use types::*;
