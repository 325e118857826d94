use std::process::ExitCode;

fn main() -> ExitCode {
    match rankmap::run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("rankmap: error: {e:#}");
            ExitCode::from(rankmap::exit_code(&e) as u8)
        }
    }
}
