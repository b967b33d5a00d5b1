pub mod calendar;
pub mod config;
pub mod db;
pub mod gateway;
pub mod reconciler;
pub mod version;
pub mod web;
