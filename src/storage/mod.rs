pub mod connection;
pub mod entity;
pub mod repository;
pub mod slug;

pub use connection::{create_schema, establish_connection};
