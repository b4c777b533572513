use std::path::PathBuf;
use std::process::ExitCode;

use sensorlink_lib::settings::load_settings;

#[tokio::main]
async fn main() -> ExitCode {
    // Optional single argument: path to a settings TOML file
    let path = std::env::args_os().nth(1).map(PathBuf::from);

    let settings = match load_settings(path.as_deref()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("sensorlink: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match sensorlink_lib::run(settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("sensorlink: {}", e);
            ExitCode::FAILURE
        }
    }
}
