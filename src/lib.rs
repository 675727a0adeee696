pub mod config;
pub mod consensus;
pub mod db;
pub mod error;
pub mod ledger;
pub mod models;
pub mod publisher;
pub mod tasks;
pub mod webhook;
