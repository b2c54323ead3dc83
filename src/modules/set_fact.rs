// set_fact module - write host facts

use crate::executor::{ExecutionContext, TaskOutput};
use crate::output::errors::ConvergeError;
use crate::parser::ast::Value;

#[derive(Default)]
pub struct SetFactModule;

impl SetFactModule {
    /// Facts are host-local; they reach the run store only through `publish`
    pub fn execute(
        &self,
        ctx: &ExecutionContext,
        facts: &[(String, Value)],
    ) -> Result<TaskOutput, ConvergeError> {
        let mut output = TaskOutput::success();
        for (key, value) in facts {
            ctx.set_fact(key.clone(), value.clone());
            output = output.with_data(key.clone(), value.clone());
        }

        let keys: Vec<&str> = facts.iter().map(|(k, _)| k.as_str()).collect();
        Ok(output.with_message(format!("set {}", keys.join(", "))))
    }
}
