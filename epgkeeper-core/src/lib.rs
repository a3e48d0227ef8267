#[cfg(test)]
#[macro_use]
mod test_macros;

pub mod command_util;
pub mod config;
pub mod database;
pub mod datetime_ext;
pub mod epg;
pub mod error;
pub mod events;
pub mod jobs;
pub mod models;
pub mod provider;
pub mod tracing_ext;

mod sync_ext;
