use diag_logcat::error::DiagLogcatError;
use diag_logcat::stamp::correct_files;

use env_logger::Env;
use log::{error, info};

fn run() -> Result<(), DiagLogcatError> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 4 {
        return Err(DiagLogcatError::Usage(format!(
            "{} <data log> <stamp log> <output log>",
            args[0]
        )));
    }

    let report = correct_files(&args[1], &args[2], &args[3])?;
    if report.discarded() > 0 {
        info!(
            "discarded {} corrupt, {} unsupported and {} unanchored frames",
            report.corrupt.len(),
            report.unsupported.len(),
            report.unanchored.len()
        );
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    if let Err(err) = run() {
        error!("{}", err);
        std::process::exit(err.exit_code());
    }
}
