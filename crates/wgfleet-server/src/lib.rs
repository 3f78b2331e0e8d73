pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod routes;
pub mod scheduler;
pub mod service;
pub mod wg;
