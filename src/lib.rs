pub mod config;
pub mod humanize;
pub mod observability;
pub mod registry;
pub mod transfer;
