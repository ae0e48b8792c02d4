//! Roster.
//!
//! Roster is a small web service that keeps a directory of users. Lookups by id are served
//! through an in-process cache and coalesced or raced against the database, so that a burst of
//! requests for the same user costs a single database round trip.

#![warn(
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cli;
mod endpoints;
mod logging;
mod server;
mod service;

#[cfg(test)]
mod test;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
