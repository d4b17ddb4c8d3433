pub mod db;
pub mod message;
pub mod payloads;
