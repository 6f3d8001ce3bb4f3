pub mod config;
pub mod postgres;
pub mod redis;
pub mod startup;
