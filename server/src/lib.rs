pub extern crate actix_web;

pub mod auth;
mod bus;
pub mod connection;
pub mod directory;
pub mod document;
pub mod error;
pub mod executor;
pub mod handlers;
mod relay;
pub mod server;
pub mod settings;
