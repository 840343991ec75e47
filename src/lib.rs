// Library for tests to access modules

pub mod component;
pub mod config;
pub mod engine;
pub mod event;
pub mod models;
pub mod registry;
pub mod routes;
pub mod store;
pub mod tag;
pub mod template;
pub mod trigger;
pub mod version;
pub mod watcher;
