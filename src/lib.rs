pub mod collab;
pub mod config;
pub mod db;
pub mod diff;
pub mod extract;
pub mod harvest;
pub mod model;
pub mod proxy;
pub mod scheduler;
pub mod session;
pub mod transport;
