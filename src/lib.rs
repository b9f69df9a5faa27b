pub mod actions;
pub mod bridge;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod navigator;
pub mod recovery;
pub mod reporter;
pub mod router;
pub mod runtime;
pub mod schema;
pub mod slots;
pub mod snapshot;
pub mod store;
pub mod telegram;

#[cfg(test)]
mod testing;

/// True when the variable is set to 1/true/yes/on.
pub fn env_flag(key: &str) -> bool {
    std::env::var(key).map(|v| config::parse_flag(&v)).unwrap_or(false)
}
