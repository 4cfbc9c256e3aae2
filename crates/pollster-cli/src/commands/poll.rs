use chrono::Utc;
use clap::Subcommand;
use pollster_core::NewPoll;

use super::{open_service, parse_time, print_json, CliResult};

#[derive(Subcommand)]
pub enum PollAction {
    /// Create a poll and schedule it
    Create {
        #[arg(long)]
        title: String,
        #[arg(long)]
        question: String,
        /// Option text (repeat for each option)
        #[arg(long = "option", required = true)]
        options: Vec<String>,
        /// Author identity, subscribed to the poll's announcements
        #[arg(long)]
        author: String,
        /// Start time: RFC 3339 or an offset like +30s, +5m
        #[arg(long)]
        start: String,
        /// End time: RFC 3339 or an offset like +30s, +5m
        #[arg(long)]
        end: String,
    },
    /// Print a poll as JSON
    Get { id: String },
    /// List polls by author
    List {
        #[arg(long)]
        author: String,
    },
    /// Delete a poll
    Delete { id: String },
    /// Show the poll's state and workflow status
    Status { id: String },
}

pub async fn run(action: PollAction) -> CliResult {
    let (_config, service) = open_service()?;
    match action {
        PollAction::Create {
            title,
            question,
            options,
            author,
            start,
            end,
        } => {
            let now = Utc::now();
            let request = NewPoll {
                title,
                question,
                options,
                author,
                start_time: parse_time(&start, now)?,
                end_time: parse_time(&end, now)?,
            };
            let poll = service.create_poll(request).await?;
            print_json(&poll)?;
        }
        PollAction::Get { id } => {
            print_json(&service.get_poll(&id).await?)?;
        }
        PollAction::List { author } => {
            print_json(&service.polls_by_author(&author).await?)?;
        }
        PollAction::Delete { id } => {
            service.delete_poll(&id).await?;
            println!("Poll deleted: {id}");
        }
        PollAction::Status { id } => {
            print_json(&service.workflow_status(&id).await?)?;
        }
    }
    Ok(())
}
