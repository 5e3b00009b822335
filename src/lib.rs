pub mod aws;
pub mod chef;
pub mod config;
pub mod host;
pub mod keys;
pub mod provider;
pub mod provision;
pub mod remote;
pub mod state;
