// Debug module - render a message into the task result

use crate::executor::TaskOutput;
use crate::parser::ast::Expression;

#[derive(Default)]
pub struct DebugModule;

impl DebugModule {
    pub fn execute(&self, msg: &str) -> TaskOutput {
        TaskOutput::success()
            .with_stdout(msg)
            .with_message(msg)
    }

    /// How a `var:` expression is labelled in the output
    pub fn label(expr: &Expression) -> String {
        match expr {
            Expression::Variable(path) => path.join("."),
            Expression::FactRef(r) => r.to_string(),
            _ => "value".to_string(),
        }
    }
}
