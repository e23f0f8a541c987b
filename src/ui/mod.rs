//! Terminal output for the operator CLI
//!
//! Uses `cliclack` for styled output and prompts in a terminal, with plain
//! line output when stdout is piped or running under CI.

mod context;
mod output;
mod progress;
mod prompts;

pub use context::UiContext;
pub use output::{
    format_bytes, intro, key_value, outro_success, remark, step_info, step_ok, step_ok_detail,
    step_warn, step_warn_hint,
};
pub use progress::{RebuildProgress, TaskSpinner};
pub use prompts::confirm;
