#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

pub mod config;
pub mod logging;
pub mod models;
pub mod train;

#[path = "../data/mod.rs"]
pub mod data;

#[path = "../tune/mod.rs"]
pub mod tune;
