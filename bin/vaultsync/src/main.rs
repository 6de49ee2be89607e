#![deny(unsafe_code)]

use std::{env, io, process::ExitCode};

fn main() -> ExitCode {
    let mut stdout = io::stdout().lock();
    let status = cli::run(env::args_os(), &mut stdout);
    cli::exit_code_from(status)
}

#[cfg(test)]
mod tests {
    use std::process::ExitCode;

    #[test]
    fn version_flag_reports_success() {
        let mut stdout = Vec::new();
        let status = cli::run(["vaultsync", "--version"], &mut stdout);
        assert_eq!(cli::exit_code_from(status), ExitCode::SUCCESS);
        assert!(!stdout.is_empty());
    }
}
