pub mod container;
pub mod histogram;
pub mod kube_context;
pub mod procfs;
