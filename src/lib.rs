pub mod auth;
pub mod cache;
pub mod config;
pub mod engine;
pub mod feed;
pub mod housekeeping;
pub mod http;
pub mod limits;
pub mod mailer;
pub mod model;
pub mod observability;
pub mod sql;
pub mod tls;
pub mod wal;
pub mod wire;
