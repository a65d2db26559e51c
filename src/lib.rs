pub mod config;
pub mod error;
pub mod gateway;
pub mod ratelimit;
pub mod rest;
pub mod snowflake;
