//! Pool manager.
//!
//! The pool manager is a standalone web service that hands out the address of a running instance
//! for a function. It keeps pools of pre-warmed, generic instances per environment and
//! specializes one of them the first time a function version is requested.

#![warn(missing_debug_implementations, clippy::all)]

#[cfg(not(target_env = "msvc"))]
use jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

mod cli;
mod endpoints;
mod healthcheck;
mod logging;
mod server;
mod service;


fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
