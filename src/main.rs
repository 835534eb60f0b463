//! dataprov - multi-backend file storage with a local cache

use std::process::ExitCode;

fn main() -> ExitCode {
    if let Err(e) = dataprov::cli::run() {
        eprintln!("Error: {:#}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
