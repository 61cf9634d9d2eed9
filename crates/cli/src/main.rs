use std::process::ExitCode;

fn main() -> ExitCode {
    tradeback_cli::run()
}
