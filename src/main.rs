use std::process;

use clap::Parser;

use libkeel::cli::Options;
use libkeel::logging;

fn main() {
    let options = Options::parse();

    // Also installs the panic reporter, so crashes reach the same sinks
    // as engine errors.
    let _log_guard = logging::init(options.log_settings());

    if let Err(err) = options.run() {
        log::error!("{:?}", err);
        process::exit(1);
    }
}
