#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

pub mod config;
pub mod consensus;
pub mod data;
pub mod diagnostics;
pub mod heuristics;
pub mod report;
pub mod sweep;
