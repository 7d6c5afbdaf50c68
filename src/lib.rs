pub mod cache;
pub mod config;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod store;
pub mod telemetry;
pub mod uptime;

#[cfg(test)]
pub mod test_support;
