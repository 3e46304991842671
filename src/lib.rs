pub mod auth;
pub mod calendar;
pub mod clock;
pub mod config;
pub mod engine;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod ratelimit;
pub mod reaper;
pub mod sql;
pub mod tenant;
pub mod token;
pub mod wal;
pub mod wire;
