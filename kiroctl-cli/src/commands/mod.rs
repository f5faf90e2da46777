pub mod init;
pub mod service;
pub mod start;
