pub mod config;
pub mod data;
pub mod decoder;
pub mod ebpf;
pub mod exporter;
pub mod scanner;
pub mod server;
pub mod sink;
