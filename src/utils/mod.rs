#![forbid(unsafe_code)]

pub mod busya_utils;
pub mod config;
pub mod errors;
