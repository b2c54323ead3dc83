// Parser for converge run declarations

pub mod ast;
pub mod expressions;
pub mod yaml;

pub use ast::*;
pub use expressions::{has_interpolation, parse_condition, parse_expression, parse_interpolated_string};
pub use yaml::{parse_duration, parse_playbook, parse_playbook_file};
