// Pause module - sleep between tasks

use std::time::Duration;

use crate::executor::{ExecutionContext, TaskOutput};
use crate::output::errors::ConvergeError;

#[derive(Default)]
pub struct PauseModule;

impl PauseModule {
    pub async fn execute(
        &self,
        ctx: &ExecutionContext,
        duration: Duration,
    ) -> Result<TaskOutput, ConvergeError> {
        if !ctx.check_mode {
            tokio::time::sleep(duration).await;
        }
        Ok(TaskOutput::success().with_message(format!("Paused for {:?}", duration)))
    }
}
