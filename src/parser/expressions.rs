// Expression parser for ${...} substitutions and conditions

use pest::iterators::{Pair, Pairs};
use pest::Parser;
use pest_derive::Parser;

use super::ast::{BinaryOperator, Expression, FactRef, StringPart, UnaryOperator};
use crate::output::errors::{ConvergeError, ParseError, ParseErrorKind};

#[derive(Parser)]
#[grammar = "parser/expressions.pest"]
pub struct ExpressionParser;

/// Parse an expression string (without ${} delimiters)
pub fn parse_expression(input: &str) -> Result<Expression, ConvergeError> {
    let mut pairs = ExpressionParser::parse(Rule::expression, input).map_err(|e| {
        ConvergeError::Parse(Box::new(
            ParseError::new(
                ParseErrorKind::InvalidExpression,
                format!("Failed to parse expression '{}': {}", input, e),
            )
            .with_suggestion("Check expression syntax"),
        ))
    })?;

    let expression = next_pair(&mut pairs)?;
    parse_or_expr(next_pair(&mut expression.into_inner())?)
}

/// Parse a string that may contain ${...} substitutions
pub fn parse_interpolated_string(input: &str) -> Result<Expression, ConvergeError> {
    let mut parts = Vec::new();
    let mut current_literal = String::new();
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            if !current_literal.is_empty() {
                parts.push(StringPart::Literal(std::mem::take(&mut current_literal)));
            }
            chars.next();

            let mut depth = 1;
            let mut expr_str = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                match c {
                    '{' => {
                        depth += 1;
                        expr_str.push(c);
                    }
                    '}' => {
                        depth -= 1;
                        if depth == 0 {
                            closed = true;
                            break;
                        }
                        expr_str.push(c);
                    }
                    _ => expr_str.push(c),
                }
            }

            if !closed {
                return Err(ConvergeError::Parse(Box::new(
                    ParseError::new(
                        ParseErrorKind::InvalidExpression,
                        format!("Unterminated substitution in '{}'", input),
                    )
                    .with_suggestion("Close the substitution with '}'"),
                )));
            }

            parts.push(StringPart::Expression(parse_expression(&expr_str)?));
        } else if c == '\\' && chars.peek() == Some(&'$') {
            chars.next();
            current_literal.push('$');
        } else {
            current_literal.push(c);
        }
    }

    if !current_literal.is_empty() {
        parts.push(StringPart::Literal(current_literal));
    }

    match parts.len() {
        0 => Ok(Expression::String(String::new())),
        1 => match parts.remove(0) {
            StringPart::Literal(s) => Ok(Expression::String(s)),
            // A lone substitution keeps the value's type
            StringPart::Expression(e) => Ok(e),
        },
        _ => Ok(Expression::InterpolatedString(parts)),
    }
}

/// Parse a guard or predicate, accepting both `x > 1` and `${x > 1}`
pub fn parse_condition(input: &str) -> Result<Expression, ConvergeError> {
    let trimmed = input.trim();
    if trimmed.starts_with("${") && trimmed.ends_with('}') && trimmed.matches("${").count() == 1 {
        parse_expression(&trimmed[2..trimmed.len() - 1])
    } else {
        parse_expression(trimmed)
    }
}

/// Check if a string contains any ${...} interpolation
pub fn has_interpolation(s: &str) -> bool {
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            return true;
        }
        if c == '\\' {
            chars.next();
        }
    }
    false
}

fn next_pair<'a>(pairs: &mut Pairs<'a, Rule>) -> Result<Pair<'a, Rule>, ConvergeError> {
    pairs.next().ok_or_else(|| {
        ConvergeError::parse(
            ParseErrorKind::InvalidExpression,
            "Incomplete expression",
        )
    })
}

fn binary(left: Expression, op: BinaryOperator, right: Expression) -> Expression {
    Expression::BinaryOp {
        left: Box::new(left),
        op,
        right: Box::new(right),
    }
}

fn parse_or_expr(pair: Pair<Rule>) -> Result<Expression, ConvergeError> {
    let mut inner = pair.into_inner();
    let mut left = parse_and_expr(next_pair(&mut inner)?)?;

    for pair in inner.filter(|p| p.as_rule() != Rule::or_op) {
        left = binary(left, BinaryOperator::Or, parse_and_expr(pair)?);
    }

    Ok(left)
}

fn parse_and_expr(pair: Pair<Rule>) -> Result<Expression, ConvergeError> {
    let mut inner = pair.into_inner();
    let mut left = parse_not_expr(next_pair(&mut inner)?)?;

    for pair in inner.filter(|p| p.as_rule() != Rule::and_op) {
        left = binary(left, BinaryOperator::And, parse_not_expr(pair)?);
    }

    Ok(left)
}

fn parse_not_expr(pair: Pair<Rule>) -> Result<Expression, ConvergeError> {
    let mut inner = pair.into_inner();
    let first = next_pair(&mut inner)?;

    match first.as_rule() {
        Rule::not_op => Ok(Expression::UnaryOp {
            op: UnaryOperator::Not,
            operand: Box::new(parse_not_expr(next_pair(&mut inner)?)?),
        }),
        _ => parse_comparison(first),
    }
}

fn parse_comparison(pair: Pair<Rule>) -> Result<Expression, ConvergeError> {
    let mut inner = pair.into_inner();
    let left = parse_additive(next_pair(&mut inner)?)?;

    let Some(op_pair) = inner.next() else {
        return Ok(left);
    };

    let op_text = op_pair.as_str();
    let op = match op_text {
        "==" => BinaryOperator::Eq,
        "!=" => BinaryOperator::Ne,
        "<" => BinaryOperator::Lt,
        "<=" => BinaryOperator::Le,
        ">" => BinaryOperator::Gt,
        ">=" => BinaryOperator::Ge,
        "in" => BinaryOperator::In,
        s if s.starts_with("not") => BinaryOperator::NotIn,
        other => {
            return Err(ConvergeError::parse(
                ParseErrorKind::InvalidExpression,
                format!("Unknown comparison operator '{}'", other),
            ))
        }
    };

    let right = parse_additive(next_pair(&mut inner)?)?;
    Ok(binary(left, op, right))
}

fn parse_additive(pair: Pair<Rule>) -> Result<Expression, ConvergeError> {
    let mut inner = pair.into_inner();
    let mut left = parse_unary(next_pair(&mut inner)?)?;

    while let Some(op_pair) = inner.next() {
        let op = if op_pair.as_str() == "-" {
            BinaryOperator::Sub
        } else {
            BinaryOperator::Add
        };
        let right = parse_unary(next_pair(&mut inner)?)?;
        left = binary(left, op, right);
    }

    Ok(left)
}

fn parse_unary(pair: Pair<Rule>) -> Result<Expression, ConvergeError> {
    let mut inner = pair.into_inner();
    let first = next_pair(&mut inner)?;

    match first.as_rule() {
        Rule::unary_op => Ok(Expression::UnaryOp {
            op: UnaryOperator::Neg,
            operand: Box::new(parse_unary(next_pair(&mut inner)?)?),
        }),
        _ => parse_postfix(first),
    }
}

fn parse_postfix(pair: Pair<Rule>) -> Result<Expression, ConvergeError> {
    let mut inner = pair.into_inner();
    let mut expr = parse_primary(next_pair(&mut inner)?)?;

    for op in inner {
        let index = match op.as_rule() {
            Rule::index => parse_or_expr(next_pair(&mut op.into_inner())?)?,
            _ => Expression::String(next_pair(&mut op.into_inner())?.as_str().to_string()),
        };

        expr = match expr {
            // Keep fact references typed: facts.x["stdout"] is still a reference
            Expression::FactRef(mut fact) => match index {
                Expression::String(segment) => {
                    fact.path.push(segment);
                    Expression::FactRef(fact)
                }
                Expression::Integer(i) => {
                    fact.path.push(i.to_string());
                    Expression::FactRef(fact)
                }
                other => Expression::Index {
                    object: Box::new(Expression::FactRef(fact)),
                    index: Box::new(other),
                },
            },
            object => Expression::Index {
                object: Box::new(object),
                index: Box::new(index),
            },
        };
    }

    Ok(expr)
}

fn parse_primary(pair: Pair<Rule>) -> Result<Expression, ConvergeError> {
    let inner = next_pair(&mut pair.into_inner())?;

    match inner.as_rule() {
        Rule::or_expr => parse_or_expr(inner),
        Rule::list_literal => {
            let items: Result<Vec<_>, _> = inner.into_inner().map(parse_or_expr).collect();
            Ok(Expression::List(items?))
        }
        Rule::float_literal => inner
            .as_str()
            .parse()
            .map(Expression::Float)
            .map_err(|e| invalid_literal(inner.as_str(), e)),
        Rule::int_literal => inner
            .as_str()
            .parse()
            .map(Expression::Integer)
            .map_err(|e| invalid_literal(inner.as_str(), e)),
        Rule::bool_literal => Ok(Expression::Boolean(inner.as_str().eq_ignore_ascii_case("true"))),
        Rule::null_literal => Ok(Expression::Null),
        Rule::string_literal => Ok(Expression::String(parse_string_literal(inner)?)),
        Rule::variable => {
            let path: Vec<String> = inner.into_inner().map(|p| p.as_str().to_string()).collect();
            variable_or_fact_ref(path)
        }
        rule => Err(ConvergeError::parse(
            ParseErrorKind::InvalidExpression,
            format!("Unexpected token {:?}", rule),
        )),
    }
}

fn invalid_literal(text: &str, err: impl std::fmt::Display) -> ConvergeError {
    ConvergeError::parse(
        ParseErrorKind::InvalidExpression,
        format!("Invalid number '{}': {}", text, err),
    )
}

/// `facts.KEY...` and `groups.GROUP.KEY...` become typed fact references
fn variable_or_fact_ref(path: Vec<String>) -> Result<Expression, ConvergeError> {
    let incomplete = |form: &str| {
        ConvergeError::Parse(Box::new(
            ParseError::new(
                ParseErrorKind::InvalidExpression,
                format!("Incomplete fact reference '{}'", path.join(".")),
            )
            .with_suggestion(format!("Use the form '{}'", form)),
        ))
    };

    match path.first().map(String::as_str) {
        Some("facts") => {
            if path.len() < 2 {
                return Err(incomplete("facts.KEY"));
            }
            Ok(Expression::FactRef(FactRef {
                group: None,
                key: path[1].clone(),
                path: path[2..].to_vec(),
            }))
        }
        Some("groups") => {
            if path.len() < 3 {
                return Err(incomplete("groups.GROUP.KEY"));
            }
            Ok(Expression::FactRef(FactRef {
                group: Some(path[1].clone()),
                key: path[2].clone(),
                path: path[3..].to_vec(),
            }))
        }
        _ => Ok(Expression::Variable(path)),
    }
}

fn parse_string_literal(pair: Pair<Rule>) -> Result<String, ConvergeError> {
    let raw = next_pair(&mut pair.into_inner())?.as_str();

    let mut result = String::with_capacity(raw.len());
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            result.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => result.push('\n'),
            Some('r') => result.push('\r'),
            Some('t') => result.push('\t'),
            Some(escaped @ ('\\' | '"' | '\'' | '$')) => result.push(escaped),
            Some(other) => {
                result.push('\\');
                result.push(other);
            }
            None => result.push('\\'),
        }
    }

    Ok(result)
}
