pub mod ca;
pub mod gameprobe;
pub mod handler;
pub mod pathresolver;
pub mod service;
pub mod tree;

pub use service::FileService;
