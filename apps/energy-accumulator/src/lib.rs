pub mod accumulator;
pub mod cli;
pub mod config;
pub mod http;
pub mod integrate;
pub mod mqtt;
pub mod observation;
pub mod reset;
pub mod service;
pub mod sources;
pub mod store;
pub mod units;
