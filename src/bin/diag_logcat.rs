use std::convert::Infallible;

use diag_logcat::capture::{run_capture, CaptureOptions, LogNames};
use diag_logcat::config::{parse_config, CaptureConfig};
use diag_logcat::error::DiagLogcatError;
#[cfg(all(feature = "libdiag", any(target_os = "linux", target_os = "android")))]
use diag_logcat::libdiag::LibDiag;
use diag_logcat::negotiation::LoggingFallback;
use diag_logcat::transport::{open_transport, write_commands};

use env_logger::Env;
use log::{error, info};

fn read_command_file(path: &str) -> Result<Vec<u8>, DiagLogcatError> {
    let commands = std::fs::read(path).map_err(|source| DiagLogcatError::CommandFileUnreadable {
        path: path.to_string(),
        source,
    })?;
    if commands.is_empty() {
        return Err(DiagLogcatError::EmptyCommandFile(path.to_string()));
    }
    Ok(commands)
}

fn run() -> Result<Infallible, DiagLogcatError> {
    let args: Vec<String> = std::env::args().collect();
    if !(4..=5).contains(&args.len()) {
        return Err(DiagLogcatError::Usage(format!(
            "{} <DIAG CFG> <DLOG PREFIX> <TLOG PREFIX> [CONFIG.toml]",
            args[0]
        )));
    }
    let config = match args.get(4) {
        Some(path) => parse_config(path)?,
        None => CaptureConfig::default(),
    };
    let commands = read_command_file(&args[1])?;

    #[cfg(all(feature = "libdiag", any(target_os = "linux", target_os = "android")))]
    let mut libdiag = LibDiag::new(config.libdiag_paths.clone());
    #[cfg(all(feature = "libdiag", any(target_os = "linux", target_os = "android")))]
    let fallback: Option<&mut dyn LoggingFallback> = Some(&mut libdiag);
    #[cfg(not(all(feature = "libdiag", any(target_os = "linux", target_os = "android"))))]
    let fallback: Option<&mut dyn LoggingFallback> = None;

    let mut transport = open_transport(&config, fallback).map_err(DiagLogcatError::DiagInitError)?;
    let sent = write_commands(transport.as_mut(), &commands).map_err(DiagLogcatError::CommandWriteError)?;
    info!("sent {} command frames to {}", sent, transport.name());

    let mut names = LogNames::new(&args[2], &args[3]);
    let result = run_capture(transport.as_mut(), &mut names, &CaptureOptions::from(&config));
    transport.close();
    Ok(result?)
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    match run() {
        Ok(never) => match never {},
        Err(err) => {
            error!("{}", err);
            std::process::exit(err.exit_code());
        }
    }
}
