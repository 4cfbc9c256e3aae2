use super::{open_service, print_json, CliResult};

/// Print the active polls, earliest activation first.
pub async fn run() -> CliResult {
    let (_config, service) = open_service()?;
    print_json(&service.feed().await?)
}
