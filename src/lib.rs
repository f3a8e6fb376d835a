pub mod app;
pub mod client;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod extension;
pub mod graph;
pub mod io;
pub mod msg;
pub mod path;
pub mod protocol;
pub mod remote;
pub mod runloop;
mod test;
pub mod transport;
pub mod utils;
