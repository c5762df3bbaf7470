//! CLI command handlers.

mod add;
mod list;
mod manage;
mod resolve;
mod run;

pub(crate) use add::run_add_command;
pub(crate) use list::run_list_command;
pub(crate) use manage::{run_edit_command, run_remove_command, run_retry_command};
pub(crate) use resolve::run_resolve_command;
pub(crate) use run::run_queue_command;
