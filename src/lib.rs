pub mod config;
pub mod error;
pub mod harvest;
pub mod mapper;
pub mod oai;
pub mod search;
pub mod storage;
