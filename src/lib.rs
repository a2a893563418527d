pub mod agent;
pub mod allow_lists;
pub mod auth;
pub mod config;
pub mod connections;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod policy;
pub mod retry;
pub mod state;
pub mod transactions;
pub mod webhooks;
pub mod witnesses;
