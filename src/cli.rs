//! CLI domain: parse, route, output, and presentation only.
//! No domain orchestration; single route table dispatches to domain services.

mod output;
mod parse;
mod presentation;
mod route;

pub use output::map_error;
pub use parse::{Cli, Commands, ConfigCommands, JobsCommands};
pub use presentation::{
    format_cleanup_text, format_extraction_text, format_job_detail_text, format_job_list_text,
    format_queue_report_text, QueueReport,
};
pub use route::{command_name, RunContext};
