//! `${{ ... }}` expression evaluation.
//!
//! The grammar is closed and side-effect free:
//!
//! ```text
//! expr    := or
//! or      := and (("or" | "||") and)*
//! and     := not (("and" | "&&") not)*
//! not     := ("not" | "!") not | cmp
//! cmp     := sum (("==" | "!=" | "<" | "<=" | ">" | ">=") sum)?
//! sum     := product (("+" | "-") product)*
//! product := unary (("*" | "/" | "%") unary)*
//! unary   := "-" unary | postfix
//! postfix := primary ("." ident | "[" expr "]")*
//! primary := number | string | true | false | null | ident | "(" expr ")"
//! ```
//!
//! Bare identifiers must name a context namespace
//! (`global`, `task`, `parameters`, `env`, `outputs`).
//!
//! `and` / `or` short-circuit: an operand that cannot change the result is
//! parsed but not resolved, so `outputs.t.failed and outputs.lint.percentage > 0`
//! resolves even when `lint` never ran.

use serde_json::{Map, Number, Value};

use crate::context::ExecutionContext;
use crate::domain::error::TemplateError;

const OPEN: &str = "${{";
const CLOSE: &str = "}}";

type EvalResult<T> = std::result::Result<T, TemplateError>;

/// Evaluate a bare expression (without the `${{ }}` delimiters).
pub fn evaluate(expr: &str, ctx: &ExecutionContext) -> EvalResult<Value> {
    let tokens = tokenize(expr)?;
    let mut parser = Parser {
        expr,
        tokens,
        pos: 0,
        ctx,
        skipping: 0,
    };
    let value = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(parser.syntax(format!(
            "unexpected trailing token `{}`",
            parser.tokens[parser.pos]
        )));
    }
    Ok(value)
}

/// Substitute every `${{ }}` span in `template`.
///
/// A string that is exactly one span keeps the expression's native type;
/// otherwise each result is stringified in place.
pub fn render(template: &str, ctx: &ExecutionContext) -> EvalResult<Value> {
    let spans = find_spans(template)?;
    if spans.is_empty() {
        return Ok(Value::String(template.to_string()));
    }

    let trimmed = template.trim();
    if spans.len() == 1 {
        let (start, end) = spans[0];
        if template[start..end].trim() == trimmed {
            let inner = &template[start + OPEN.len()..end - CLOSE.len()];
            return evaluate(inner, ctx);
        }
    }

    let mut out = String::with_capacity(template.len());
    let mut cursor = 0;
    for (start, end) in spans {
        out.push_str(&template[cursor..start]);
        let inner = &template[start + OPEN.len()..end - CLOSE.len()];
        out.push_str(&stringify(&evaluate(inner, ctx)?));
        cursor = end;
    }
    out.push_str(&template[cursor..]);
    Ok(Value::String(out))
}

/// Deep-walk `value`, rendering every string inside it.
pub fn resolve_value(value: &Value, ctx: &ExecutionContext) -> EvalResult<Value> {
    match value {
        Value::String(s) => render(s, ctx),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_value(item, ctx))
            .collect::<EvalResult<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| resolve_value(v, ctx).map(|v| (k.clone(), v)))
            .collect::<EvalResult<Map<_, _>>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

/// Whether `s` contains at least one expression span.
pub fn is_templated(s: &str) -> bool {
    s.contains(OPEN)
}

/// Text form used when interpolating a value into a larger string.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Truthiness used by `and` / `or` / `not`.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn find_spans(template: &str) -> EvalResult<Vec<(usize, usize)>> {
    let mut spans = Vec::new();
    let mut cursor = 0;
    while let Some(offset) = template[cursor..].find(OPEN) {
        let start = cursor + offset;
        let body = start + OPEN.len();
        let Some(close) = template[body..].find(CLOSE) else {
            return Err(TemplateError::Syntax {
                expr: template.to_string(),
                reason: "unterminated `${{`".to_string(),
            });
        };
        let end = body + close + CLOSE.len();
        spans.push((start, end));
        cursor = end;
    }
    Ok(spans)
}

// ----------------------------------------------------------------------------
// Lexer
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    Op(&'static str),
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "{s}"),
            Token::Int(n) => write!(f, "{n}"),
            Token::Float(n) => write!(f, "{n}"),
            Token::Str(s) => write!(f, "{s:?}"),
            Token::Op(op) => write!(f, "{op}"),
        }
    }
}

const OPERATORS: &[&str] = &[
    "==", "!=", "<=", ">=", "&&", "||", "<", ">", "+", "-", "*", "/", "%", "!", ".", "[", "]",
    "(", ")",
];

fn tokenize(expr: &str) -> EvalResult<Vec<Token>> {
    let syntax = |reason: String| TemplateError::Syntax {
        expr: expr.to_string(),
        reason,
    };
    let chars: Vec<char> = expr.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() {
            let start = i;
            while i < chars.len() && chars[i].is_ascii_digit() {
                i += 1;
            }
            let mut is_float = false;
            if i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit() {
                is_float = true;
                i += 1;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
            }
            let text: String = chars[start..i].iter().collect();
            tokens.push(if is_float {
                Token::Float(text.parse().map_err(|e| syntax(format!("{text}: {e}")))?)
            } else {
                Token::Int(text.parse().map_err(|e| syntax(format!("{text}: {e}")))?)
            });
        } else if c == '"' || c == '\'' {
            let quote = c;
            let mut text = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => return Err(syntax("unterminated string literal".to_string())),
                    Some(&ch) if ch == quote => {
                        i += 1;
                        break;
                    }
                    Some('\\') => {
                        let escaped = chars
                            .get(i + 1)
                            .ok_or_else(|| syntax("dangling escape".to_string()))?;
                        text.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            other => *other,
                        });
                        i += 2;
                    }
                    Some(&ch) => {
                        text.push(ch);
                        i += 1;
                    }
                }
            }
            tokens.push(Token::Str(text));
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else {
            let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
            let op = OPERATORS
                .iter()
                .find(|op| rest.starts_with(*op))
                .ok_or_else(|| syntax(format!("unexpected character `{c}`")))?;
            tokens.push(Token::Op(op));
            i += op.chars().count();
        }
    }
    Ok(tokens)
}

// ----------------------------------------------------------------------------
// Parser / evaluator
// ----------------------------------------------------------------------------

struct Parser<'a> {
    expr: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    ctx: &'a ExecutionContext,
    /// Depth of short-circuited operands being parsed.
    skipping: u32,
}

impl<'a> Parser<'a> {
    fn syntax(&self, reason: impl Into<String>) -> TemplateError {
        TemplateError::Syntax {
            expr: self.expr.to_string(),
            reason: reason.into(),
        }
    }

    fn type_error(&self, reason: impl Into<String>) -> TemplateError {
        TemplateError::Type {
            expr: self.expr.to_string(),
            reason: reason.into(),
        }
    }

    /// Inside a short-circuited operand only syntax errors count; lookups
    /// and type errors evaluate to null.
    fn settle(&self, result: EvalResult<Value>) -> EvalResult<Value> {
        match result {
            Err(e) if self.skipping > 0 && !matches!(e, TemplateError::Syntax { .. }) => {
                Ok(Value::Null)
            }
            other => other,
        }
    }

    fn parse_operand(
        &mut self,
        skip: bool,
        parse: fn(&mut Self) -> EvalResult<Value>,
    ) -> EvalResult<Value> {
        if skip {
            self.skipping += 1;
        }
        let result = parse(self);
        if skip {
            self.skipping -= 1;
        }
        result
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn eat_op(&mut self, ops: &[&str]) -> Option<&'static str> {
        match self.peek() {
            Some(Token::Op(op)) if ops.contains(op) => {
                let op = *op;
                self.pos += 1;
                Some(op)
            }
            _ => None,
        }
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        match self.peek() {
            Some(Token::Ident(word)) if word == keyword => {
                self.pos += 1;
                true
            }
            _ => false,
        }
    }

    fn expect_op(&mut self, op: &str) -> EvalResult<()> {
        self.eat_op(&[op])
            .map(|_| ())
            .ok_or_else(|| self.syntax(format!("expected `{op}`")))
    }

    fn parse_or(&mut self) -> EvalResult<Value> {
        let mut left = self.parse_and()?;
        while self.eat_keyword("or") || self.eat_op(&["||"]).is_some() {
            let decided = truthy(&left);
            let right = self.parse_operand(decided, Self::parse_and)?;
            left = Value::Bool(decided || truthy(&right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> EvalResult<Value> {
        let mut left = self.parse_not()?;
        while self.eat_keyword("and") || self.eat_op(&["&&"]).is_some() {
            let decided = !truthy(&left);
            let right = self.parse_operand(decided, Self::parse_not)?;
            left = Value::Bool(!decided && truthy(&right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> EvalResult<Value> {
        if self.eat_keyword("not") || self.eat_op(&["!"]).is_some() {
            let value = self.parse_not()?;
            return Ok(Value::Bool(!truthy(&value)));
        }
        self.parse_cmp()
    }

    fn parse_cmp(&mut self) -> EvalResult<Value> {
        let left = self.parse_sum()?;
        let Some(op) = self.eat_op(&["==", "!=", "<", "<=", ">", ">="]) else {
            return Ok(left);
        };
        let right = self.parse_sum()?;
        let result = self.compare(op, &left, &right).map(Value::Bool);
        self.settle(result)
    }

    fn compare(&self, op: &str, left: &Value, right: &Value) -> EvalResult<bool> {
        let ordering = match op {
            "==" => return Ok(loosely_equal(left, right)),
            "!=" => return Ok(!loosely_equal(left, right)),
            _ => match (left, right) {
                (Value::Number(a), Value::Number(b)) => a.as_f64().partial_cmp(&b.as_f64()),
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => None,
            },
        }
        .ok_or_else(|| self.type_error(format!("cannot compare {left} and {right}")))?;
        Ok(match op {
            "<" => ordering.is_lt(),
            "<=" => ordering.is_le(),
            ">" => ordering.is_gt(),
            _ => ordering.is_ge(),
        })
    }

    fn parse_sum(&mut self) -> EvalResult<Value> {
        let mut left = self.parse_product()?;
        while let Some(op) = self.eat_op(&["+", "-"]) {
            let right = self.parse_product()?;
            left = self.settle(self.arithmetic(op, &left, &right))?;
        }
        Ok(left)
    }

    fn parse_product(&mut self) -> EvalResult<Value> {
        let mut left = self.parse_unary()?;
        while let Some(op) = self.eat_op(&["*", "/", "%"]) {
            let right = self.parse_unary()?;
            left = self.settle(self.arithmetic(op, &left, &right))?;
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> EvalResult<Value> {
        if self.eat_op(&["-"]).is_some() {
            let value = self.parse_unary()?;
            return self.settle(self.arithmetic("-", &Value::from(0), &value));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> EvalResult<Value> {
        let (mut value, mut path) = self.parse_primary()?;
        loop {
            if self.eat_op(&["."]).is_some() {
                let key = match self.peek() {
                    Some(Token::Ident(key)) => key.clone(),
                    Some(Token::Int(idx)) => idx.to_string(),
                    _ => return Err(self.syntax("expected a name after `.`")),
                };
                self.pos += 1;
                path = format!("{path}.{key}");
                value = self.settle(self.member(&value, &Value::String(key), &path))?;
            } else if self.eat_op(&["["]).is_some() {
                let index = self.parse_or()?;
                self.expect_op("]")?;
                path = format!("{path}[{}]", stringify(&index));
                value = self.settle(self.member(&value, &index, &path))?;
            } else {
                return Ok(value);
            }
        }
    }

    fn member(&self, value: &Value, key: &Value, path: &str) -> EvalResult<Value> {
        let found = match (value, key) {
            (Value::Object(map), Value::String(k)) => map.get(k),
            (Value::Array(items), Value::String(k)) => {
                k.parse::<usize>().ok().and_then(|i| items.get(i))
            }
            (Value::Array(items), Value::Number(n)) => {
                n.as_u64().and_then(|i| items.get(i as usize))
            }
            (Value::Object(map), Value::Number(n)) => map.get(&n.to_string()),
            _ => {
                return Err(self.type_error(format!("`{path}`: cannot index into {value}")));
            }
        };
        found.cloned().ok_or_else(|| TemplateError::Undefined {
            expr: self.expr.to_string(),
            name: path.to_string(),
        })
    }

    fn parse_primary(&mut self) -> EvalResult<(Value, String)> {
        let token = self
            .peek()
            .cloned()
            .ok_or_else(|| self.syntax("unexpected end of expression"))?;
        self.pos += 1;
        let value = match &token {
            Token::Int(n) => Value::from(*n),
            Token::Float(f) => Number::from_f64(*f)
                .map(Value::Number)
                .ok_or_else(|| self.type_error(format!("invalid number {f}")))?,
            Token::Str(s) => Value::String(s.clone()),
            Token::Ident(word) => match word.as_str() {
                "true" | "True" => Value::Bool(true),
                "false" | "False" => Value::Bool(false),
                "null" | "none" | "None" => Value::Null,
                name => self.settle(self.ctx.namespace(name).cloned().ok_or_else(|| {
                    TemplateError::Undefined {
                        expr: self.expr.to_string(),
                        name: name.to_string(),
                    }
                }))?,
            },
            Token::Op("(") => {
                let inner = self.parse_or()?;
                self.expect_op(")")?;
                inner
            }
            Token::Op(op) => return Err(self.syntax(format!("unexpected `{op}`"))),
        };
        Ok((value, token.to_string()))
    }

    fn arithmetic(&self, op: &str, left: &Value, right: &Value) -> EvalResult<Value> {
        if op == "+" {
            if let (Value::String(a), Value::String(b)) = (left, right) {
                return Ok(Value::String(format!("{a}{b}")));
            }
        }
        let (Value::Number(a), Value::Number(b)) = (left, right) else {
            return Err(self.type_error(format!("cannot apply `{op}` to {left} and {right}")));
        };

        if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
            let exact = match op {
                "+" => x.checked_add(y),
                "-" => x.checked_sub(y),
                "*" => x.checked_mul(y),
                "%" if y != 0 => x.checked_rem_euclid(y),
                _ => None,
            };
            if let Some(n) = exact {
                return Ok(Value::from(n));
            }
        }

        let (x, y) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
        if matches!(op, "/" | "%") && y == 0.0 {
            return Err(self.type_error("division by zero"));
        }
        let result = match op {
            "+" => x + y,
            "-" => x - y,
            "*" => x * y,
            "/" => x / y,
            _ => x.rem_euclid(y),
        };
        Number::from_f64(result)
            .map(Value::Number)
            .ok_or_else(|| self.type_error(format!("`{op}` produced a non-finite number")))
    }
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{GlobalVariables, PipelineStageResult, TaskVariables};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn ctx() -> ExecutionContext {
        let global = GlobalVariables {
            temp_dir: "/tmp/run".into(),
            username: "student".to_string(),
            task_names: vec!["hello".to_string(), "sum".to_string()],
            ..Default::default()
        };
        let params: BTreeMap<String, Value> = [
            ("timeout".to_string(), json!(10)),
            ("run_testing".to_string(), json!(true)),
            ("flags".to_string(), json!(["-O2", "-Wall"])),
        ]
        .into();
        let task = TaskVariables {
            task_name: "hello".to_string(),
            task_sub_path: "intro/hello".to_string(),
            task_score_percent: 0.5,
            ..Default::default()
        };
        let mut ctx = ExecutionContext::new(&global, &BTreeMap::new())
            .with_env([("CI".to_string(), "true".to_string())])
            .for_task(&task, &params);
        ctx.register_output("tests", &PipelineStageResult::success("tests", "ok", 0.75));
        ctx
    }

    #[test]
    fn test_native_type_is_preserved() {
        let ctx = ctx();
        assert_eq!(render("${{ parameters.timeout }}", &ctx).unwrap(), json!(10));
        assert_eq!(render("  ${{ parameters.run_testing }} ", &ctx).unwrap(), json!(true));
        assert_eq!(
            render("${{ parameters.flags }}", &ctx).unwrap(),
            json!(["-O2", "-Wall"])
        );
        assert_eq!(
            render("${{ outputs.tests.percentage }}", &ctx).unwrap(),
            json!(0.75)
        );
    }

    #[test]
    fn test_interpolation_stringifies() {
        let ctx = ctx();
        assert_eq!(
            render("${{ global.temp_dir }}/${{ task.task_sub_path }}", &ctx).unwrap(),
            json!("/tmp/run/intro/hello")
        );
        assert_eq!(
            render("timeout=${{ parameters.timeout }}s", &ctx).unwrap(),
            json!("timeout=10s")
        );
        assert_eq!(render("no templates here", &ctx).unwrap(), json!("no templates here"));
    }

    #[test]
    fn test_arithmetic_and_comparison() {
        let ctx = ctx();
        assert_eq!(evaluate("parameters.timeout * 2 + 1", &ctx).unwrap(), json!(21));
        assert_eq!(evaluate("parameters.timeout / 4", &ctx).unwrap(), json!(2.5));
        assert_eq!(evaluate("-(1 + 2)", &ctx).unwrap(), json!(-3));
        assert_eq!(
            evaluate("outputs.tests.percentage * task.task_score_percent", &ctx).unwrap(),
            json!(0.375)
        );
        assert_eq!(evaluate("parameters.timeout >= 10", &ctx).unwrap(), json!(true));
        assert_eq!(evaluate("task.task_name == 'hello'", &ctx).unwrap(), json!(true));
        assert_eq!(evaluate("\"a\" + \"b\"", &ctx).unwrap(), json!("ab"));
    }

    #[test]
    fn test_boolean_logic() {
        let ctx = ctx();
        assert_eq!(
            evaluate("parameters.run_testing and not outputs.tests.failed", &ctx).unwrap(),
            json!(true)
        );
        assert_eq!(evaluate("false || env.CI == 'true'", &ctx).unwrap(), json!(true));
        assert_eq!(evaluate("!parameters.run_testing", &ctx).unwrap(), json!(false));
    }

    #[test]
    fn test_logic_short_circuits() {
        let ctx = ctx();
        assert_eq!(
            evaluate("outputs.tests.failed and outputs.lint.percentage > 0", &ctx).unwrap(),
            json!(false)
        );
        assert_eq!(
            evaluate("not outputs.tests.failed or outputs.lint.percentage + 'x'", &ctx).unwrap(),
            json!(true)
        );
        // the deciding side still has to resolve
        let err = evaluate("parameters.run_testing and outputs.lint.percentage > 0", &ctx)
            .unwrap_err();
        assert!(matches!(err, TemplateError::Undefined { ref name, .. } if name == "outputs.lint"));
        // a skipped operand must still parse
        assert!(matches!(
            evaluate("false and (outputs.lint", &ctx),
            Err(TemplateError::Syntax { .. })
        ));
    }

    #[test]
    fn test_indexing() {
        let ctx = ctx();
        assert_eq!(evaluate("global.task_names[1]", &ctx).unwrap(), json!("sum"));
        assert_eq!(evaluate("parameters['flags'][0]", &ctx).unwrap(), json!("-O2"));
    }

    #[test]
    fn test_undefined_names() {
        let ctx = ctx();
        let err = evaluate("os.system", &ctx).unwrap_err();
        assert!(matches!(err, TemplateError::Undefined { ref name, .. } if name == "os"));

        let err = evaluate("outputs.missing.percentage", &ctx).unwrap_err();
        assert!(
            matches!(err, TemplateError::Undefined { ref name, .. } if name == "outputs.missing")
        );
    }

    #[test]
    fn test_syntax_and_type_errors() {
        let ctx = ctx();
        assert!(matches!(
            render("${{ parameters.timeout ", &ctx),
            Err(TemplateError::Syntax { .. })
        ));
        assert!(matches!(
            evaluate("parameters.timeout +", &ctx),
            Err(TemplateError::Syntax { .. })
        ));
        assert!(matches!(
            evaluate("1 2", &ctx),
            Err(TemplateError::Syntax { .. })
        ));
        assert!(matches!(
            evaluate("parameters.timeout / 0", &ctx),
            Err(TemplateError::Type { .. })
        ));
        assert!(matches!(
            evaluate("parameters.flags + 1", &ctx),
            Err(TemplateError::Type { .. })
        ));
    }

    #[test]
    fn test_resolve_value_walks_nested_args() {
        let ctx = ctx();
        let args = json!({
            "origin": "${{ global.temp_dir }}",
            "timeout": "${{ parameters.timeout }}",
            "script": ["make", "${{ task.task_name }}"],
            "retries": 3,
        });
        let resolved = resolve_value(&args, &ctx).unwrap();
        assert_eq!(
            resolved,
            json!({
                "origin": "/tmp/run",
                "timeout": 10,
                "script": ["make", "hello"],
                "retries": 3,
            })
        );
    }
}
