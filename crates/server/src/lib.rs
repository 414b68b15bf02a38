//! clusterops server: port-forward and cluster metrics tools over HTTP

pub mod api;
pub mod config;
