use clap::Subcommand;
use pollster_core::Config;

use super::{print_json, CliResult};

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Show the scheduler, retry, voting and notification settings
    Show {
        /// Print JSON instead of the TOML stored on disk
        #[arg(long)]
        json: bool,
    },
    /// Print one setting, e.g. "scheduler.lease_secs" or "notifications.webhook_url"
    Get {
        /// Dotted setting name
        key: String,
    },
    /// Change one setting; the whole config is validated before it is saved
    Set {
        /// Dotted setting name
        key: String,
        /// New value
        value: String,
    },
    /// Put one setting back to its default (clears the webhook URL)
    Unset {
        /// Dotted setting name
        key: String,
    },
    /// Overwrite the config file with the defaults
    Reset,
    /// Print where the config file lives
    Path {
        /// Print the poll database location instead
        #[arg(long)]
        database: bool,
    },
}

pub fn run(action: ConfigAction) -> CliResult {
    match action {
        ConfigAction::Show { json } => {
            let config = Config::load()?;
            if json {
                print_json(&config)?;
            } else {
                print!("{}", toml::to_string_pretty(&config)?);
            }
        }
        ConfigAction::Get { key } => {
            let value = lookup(&Config::load()?, &key)?;
            println!("{value}");
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load()?;
            config.set(&key, &value)?;
            println!("{key} = {}", lookup(&config, &key)?);
        }
        ConfigAction::Unset { key } => {
            let mut config = Config::load()?;
            lookup(&config, &key)?;
            // Optional settings default to null; an empty value clears them.
            let default = Config::default()
                .get(&key)
                .filter(|value| value != "null")
                .unwrap_or_default();
            config.set(&key, &default)?;
            println!("{key} = {}", lookup(&config, &key)?);
        }
        ConfigAction::Reset => {
            Config::default().save()?;
            println!("wrote defaults to {}", Config::path()?.display());
        }
        ConfigAction::Path { database } => {
            let path = if database {
                Config::load()?.database_path()?
            } else {
                Config::path()?
            };
            println!("{}", path.display());
        }
    }
    Ok(())
}

fn lookup(config: &Config, key: &str) -> Result<String, String> {
    config
        .get(key)
        .ok_or_else(|| format!("unknown key: {key}"))
}
