pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod live;
pub mod state;
pub mod web;
