//! Corestash.
//!
//! Corestash is a standalone web service that aggregates core dumps across
//! a fleet of hosts: it receives the compressed crash payloads sent by the
//! forwarder, stores cores and deduplicated executables on disk, extracts
//! stack traces with an external debugger, and exposes a full-text search
//! API over everything it knows.

#![warn(clippy::all)]

mod analysis;
mod cleanup;
mod cli;
mod config;
mod endpoints;
mod index;
mod logging;
mod metrics;
mod server;
mod service;
mod store;
mod upload;

#[cfg(test)]
mod test;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
