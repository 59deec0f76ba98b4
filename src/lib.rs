pub mod app;
pub mod catalog;
pub mod config;
pub mod discovery;
pub mod domain;
pub mod error;
pub mod fetcher;
pub mod naming;
pub mod output;
pub mod reconcile;
pub mod report;
pub mod retry;
pub mod service;
pub mod store;
pub mod tui;
pub mod worker;
