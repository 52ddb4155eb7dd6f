pub mod batch;
pub mod boundary;
pub mod cli;
pub mod compile;
pub mod config;
pub mod context;
pub mod error;
pub mod helpers;
pub mod worker;
