//! The main CLI logic.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use anyhow::{Context, Result};
use imgpkg_rust::config::ClientConfig;
use imgpkg_rust::context::{install_signal_handler, OpContext};
use imgpkg_rust::errors::exit_status_of;
use imgpkg_rust::output;
use std::io::Write;
use termcolor::WriteColor;

/// Whether `--parsable` appears among the arguments, so that errors raised
/// before the command runs are reported in the same format.
fn wants_parsable(args: &[String]) -> bool {
    args.iter()
        .take_while(|a| a.as_str() != "--")
        .any(|a| a == "--parsable" || a.starts_with("--parsable="))
}

/// The real main function returns a `Result<>`.
fn inner_main(args: Vec<String>) -> Result<i32> {
    // Initialize failpoints
    let _scenario = fail::FailScenario::setup();
    fail::fail_point!("main");
    // Logs go to stderr; stdout carries command output, which may be JSON.
    tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    tracing::trace!("starting");
    let opt = imgpkg_rust::cli::parse_args(args);
    let config = ClientConfig::from_env().context("Reading configuration from environment")?;
    let mut ctx = OpContext::new(config);
    // Must happen before any threads are created.
    install_signal_handler(&ctx)?;
    opt.run(&mut ctx)
}

fn print_error(e: &anyhow::Error) {
    let msg = format!("{:#}", e);
    // Print the error: prefix in red if we're on a tty
    let stderr = termcolor::BufferWriter::stderr(termcolor::ColorChoice::Auto);
    let stderrbuf = {
        let mut stderrbuf = stderr.buffer();
        let _ =
            stderrbuf.set_color(termcolor::ColorSpec::new().set_fg(Some(termcolor::Color::Red)));
        let _ = write!(&mut stderrbuf, "error: ");
        let _ = stderrbuf.reset();
        let _ = writeln!(&mut stderrbuf, "{}", msg);
        stderrbuf
    };
    let _ = stderr.print(&stderrbuf);
}

fn main() {
    // Gather our arguments.
    let args: Vec<String> = std::env::args_os()
        .map(|s| s.to_string_lossy().into_owned())
        .collect();
    let parsable = wants_parsable(&args);
    match inner_main(args) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            print_error(&e);
            if parsable {
                let stdout = std::io::stdout();
                let _ = output::print_parsable(&mut stdout.lock(), &output::error_to_parsable(&e));
            }
            std::process::exit(exit_status_of(&e).code())
        }
    }
}
