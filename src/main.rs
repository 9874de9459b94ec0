use std::process::ExitCode;

fn main() -> ExitCode {
    atomloop::cli_entrypoint()
}
