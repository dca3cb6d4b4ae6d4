#![forbid(unsafe_code)]

pub mod gateway;
pub mod phrases;
pub mod provider;
pub mod resolver;
