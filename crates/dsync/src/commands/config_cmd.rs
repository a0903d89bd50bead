//! `dsync config`: inspect and initialize the configuration file.

use dsync_config::Config;

use crate::cli::{ConfigCommand, GlobalOpts};
use crate::error::CliError;

pub fn handle(cmd: &ConfigCommand, global: &GlobalOpts) -> Result<(), CliError> {
    let path = super::config_path(global);
    match cmd {
        ConfigCommand::Path => {
            println!("{}", path.display());
            Ok(())
        }
        ConfigCommand::Show => {
            let config = super::load_config(global)?;
            // Surface bad durations here rather than at engine start.
            config.engine.to_engine_config()?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        ConfigCommand::Init { force } => {
            if path.exists() && !force {
                return Err(CliError::ConfigExists {
                    path: path.display().to_string(),
                });
            }
            dsync_config::save_config(&Config::default(), &path)?;
            eprintln!("Wrote {}", path.display());
            Ok(())
        }
    }
}
