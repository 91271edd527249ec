pub mod app;
pub mod archive;
pub mod catalog;
pub mod config;
pub mod convert;
pub mod domain;
pub mod epub;
pub mod error;
pub mod fetcher;
pub mod output;
pub mod shutdown;
pub mod store;
pub mod tracker;
