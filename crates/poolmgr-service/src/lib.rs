//! Function service resolution and warm-pool management.
//!
//! Given the identity of a function, the pool manager returns the address of a live instance
//! serving that function, specializing a pre-warmed instance from the environment's pool if no
//! such instance exists yet. See [`resolver::Resolver`] for the entry point.

#[macro_use]
pub mod metrics;

pub mod config;
pub mod error;
pub mod fscache;
pub mod metadata;
pub mod pool;
pub mod resolver;
pub mod services;
pub mod types;
pub mod utils;
