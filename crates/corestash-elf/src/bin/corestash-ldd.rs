//! Prints the shared libraries an executable would load, the way the
//! forwarder resolves them. Debugging aid for checking what a crash
//! upload will ship.

use std::process::exit;

use clap::Parser;
use corestash_elf::Resolver;

/// Resolves and prints the transitive shared-library dependencies of an
/// ELF executable.
#[derive(Debug, Parser)]
#[command(name = "corestash-ldd", version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Path of the executable to inspect.
    executable: String,
}

fn main() {
    let cli = Cli::parse();

    let links = match Resolver::from_env().resolve_links(&cli.executable) {
        Ok(links) => links,
        Err(err) => {
            eprintln!("resolving imported libraries: {err}");
            exit(1);
        }
    };

    for link in links {
        if !link.error.is_empty() {
            println!("{}: error while resolving: {}", link.name, link.error);
        } else if !link.found {
            println!("{}: not found", link.name);
        } else {
            println!("{} => {}", link.name, link.path);
        }
    }
}
