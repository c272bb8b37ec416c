pub mod cat;
pub mod extract;
pub mod list;
pub mod sync;

use std::{thread, time::Duration};

use anyhow::{anyhow, Result};
use glob::{MatchOptions, Pattern};

use crate::{
    operation::{Operation, OperationRef, OperationStatus},
    scheduler::Scheduler,
};

const TICK_INTERVAL: Duration = Duration::from_millis(5);

/// Tick the scheduler until `op` finishes, turning a failure into an error
pub fn run_to_completion<T: Operation + 'static>(
    scheduler: &Scheduler,
    op: &OperationRef<T>,
) -> Result<()> {
    while !op.is_done() {
        scheduler.tick();
        thread::sleep(TICK_INTERVAL);
    }
    match (op.status(), op.error()) {
        (_, Some(e)) => Err(e.into()),
        (Some(OperationStatus::Failed), None) => Err(anyhow!("Operation failed")),
        _ => Ok(()),
    }
}

/// Whether a path matches any of the patterns, `*` not crossing folders
pub fn matches_any(patterns: &[Pattern], path: &str) -> bool {
    patterns.iter().any(|pattern| {
        pattern.matches_with(
            path,
            MatchOptions {
                require_literal_separator: true,
                ..Default::default()
            },
        )
    })
}
