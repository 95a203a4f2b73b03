//! vitte-cli/src/main.rs
//!
//! Entry point for the `vitte` binary. Sets up error reporting and
//! logging, then hands off to `vitte_cli::run()`. Kept minimal so
//! `lib.rs` stays unit-testable on its own.

fn main() {
    if let Err(e) = color_eyre::install() {
        eprintln!("warning: failed to install color-eyre: {e}");
    }

    #[cfg(feature = "tracing")]
    tracing_subscriber::fmt::init();
    #[cfg(not(feature = "tracing"))]
    env_logger::init();

    match vitte_cli::run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err:?}");
            std::process::exit(1);
        }
    }
}
