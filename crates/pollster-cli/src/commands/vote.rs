use clap::Args;

use super::{open_service, print_json, CliResult};

#[derive(Args)]
pub struct VoteArgs {
    /// Poll id
    pub poll_id: String,
    /// Option id (e.g. "1")
    pub option_id: String,
}

/// Cast one vote and print the poll's tally.
pub async fn run(args: VoteArgs) -> CliResult {
    let (_config, service) = open_service()?;
    let tally = service.submit_vote(&args.poll_id, &args.option_id).await?;
    print_json(&tally)
}
