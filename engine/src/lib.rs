pub mod config;
pub mod error;
pub mod jobs;
pub mod models;
pub mod services;
pub mod storage;

#[cfg(test)]
pub(crate) mod test_utils;
