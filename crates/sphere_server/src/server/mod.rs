#![forbid(unsafe_code)]

pub mod auth;
pub mod connection;
pub mod db;
pub mod directory;
pub mod fanout;
pub mod health;
pub mod notify;
pub mod registry;
pub mod router;
pub mod state;
pub mod store;


#[cfg(test)]
mod router_tests;
