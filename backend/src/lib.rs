pub mod codec;
pub mod config;
pub mod db;
pub mod error;
pub mod link;
pub mod mission;
pub mod mission_task;
pub mod ring_buffer;
pub mod state;
pub mod web;
