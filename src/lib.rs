// converge - phase-ordered desired-state convergence for groups of hosts
//
// A run file declares phases; each phase converges one host group with an
// ordered task list, and values published in one phase are readable by the
// phases after it.

pub mod config;
pub mod executor;
pub mod inventory;
pub mod modules;
pub mod output;
pub mod parser;
pub mod plugins;
pub mod runtime;

pub use config::EngineConfig;
pub use executor::{ExecutionContext, Scheduler, SchedulerConfig, TaskOutput};
pub use inventory::{Host, HostGroup, Inventory};
pub use output::{ConvergeError, RunSummary, TerminalOutput};
pub use parser::{parse_playbook, parse_playbook_file, Playbook};
pub use runtime::evaluate_expression;

/// Version of the converge tool
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::executor::{ExecutionContext, Scheduler, SchedulerConfig};
    pub use crate::inventory::{Host, Inventory};
    pub use crate::output::{ConvergeError, RunSummary};
    pub use crate::parser::{parse_playbook, parse_playbook_file, Playbook};
}
