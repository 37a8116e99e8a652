//! Expression parser and evaluator for policy conditions and storage values.
//!
//! Supported syntax:
//! - Comparisons: `==`, `!=`, `>`, `<`, `>=`, `<=`
//! - Boolean operators: `&&`, `||`, `!`
//! - Membership: `x in collection` (array element, object key, or substring)
//! - Dot-path access into the evaluation context: `input.uri`, `storage.seen`
//! - DNS helpers: `dns.a(expr)`, `dns.ptr(expr)` (resolved before evaluation)
//! - Literals: integers, floats, `"strings"`, `true`, `false`
//! - Parentheses for grouping
//!
//! A path that does not exist in the context evaluates to null; rules treat a
//! null condition result as not matched rather than as an error.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::policy::errors::PolicyError;

// ─── AST ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(Vec<String>),
    BinOp {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    UnaryNot(Box<Expr>),
    In {
        element: Box<Expr>,
        collection: Box<Expr>,
    },
    DnsCall {
        func: DnsFunc,
        arg: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DnsFunc {
    /// `dns.a(name)` — forward lookup, names to addresses.
    A,
    /// `dns.ptr(ip)` — reverse lookup, address to names.
    Ptr,
}

impl DnsFunc {
    pub fn name(&self) -> &'static str {
        match self {
            DnsFunc::A => "dns.a",
            DnsFunc::Ptr => "dns.ptr",
        }
    }
}

/// Results of the DNS helper calls an expression needs, keyed by function and
/// evaluated argument. Filled in by the evaluator before rule evaluation so
/// that evaluation itself stays synchronous; entries are `Err` when the
/// lookup itself failed, carrying the invocation error as a string.
pub type DnsTable = BTreeMap<(DnsFunc, String), Result<Value, String>>;

// ─── Tokenizer ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    True,
    False,
    Dot,
    LParen,
    RParen,
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    And,
    Or,
    Not,
    In,
}

fn tokenize(input: &str) -> Result<Vec<Token>, PolicyError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '"' => {
                i += 1;
                let mut s = String::new();
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(PolicyError::InvalidCondition(
                                "unterminated string literal".into(),
                            ))
                        }
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some('\\') => {
                            if let Some(escaped) = chars.get(i + 1) {
                                s.push(*escaped);
                            }
                            i += 2;
                        }
                        Some(c) => {
                            s.push(*c);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let num_str: String = chars[start..i].iter().collect();
                if num_str.contains('.') {
                    let f: f64 = num_str.parse().map_err(|_| {
                        PolicyError::InvalidCondition(format!("invalid float `{num_str}`"))
                    })?;
                    tokens.push(Token::Float(f));
                } else {
                    let n: i64 = num_str.parse().map_err(|_| {
                        PolicyError::InvalidCondition(format!("invalid integer `{num_str}`"))
                    })?;
                    tokens.push(Token::Int(n));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.as_str() {
                    "true" => tokens.push(Token::True),
                    "false" => tokens.push(Token::False),
                    "in" => tokens.push(Token::In),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            c => {
                return Err(PolicyError::InvalidCondition(format!(
                    "unexpected character `{c}`"
                )));
            }
        }
    }
    Ok(tokens)
}

// ─── Parser ─────────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn expect_rparen(&mut self) -> Result<(), PolicyError> {
        if self.advance() != Some(Token::RParen) {
            return Err(PolicyError::InvalidCondition(
                "expected closing parenthesis `)`".into(),
            ));
        }
        Ok(())
    }

    /// or_expr = and_expr ("||" and_expr)*
    fn parse_expr(&mut self) -> Result<Expr, PolicyError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::BinOp {
                op: BinOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    /// and_expr = comparison ("&&" comparison)*
    fn parse_and(&mut self) -> Result<Expr, PolicyError> {
        let mut left = self.parse_comparison()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_comparison()?;
            left = Expr::BinOp {
                op: BinOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    /// comparison = unary (("==" | "!=" | ">" | "<" | ">=" | "<=" | "in") unary)?
    fn parse_comparison(&mut self) -> Result<Expr, PolicyError> {
        let left = self.parse_unary()?;
        let op = match self.peek() {
            Some(Token::Eq) => BinOp::Eq,
            Some(Token::Ne) => BinOp::Ne,
            Some(Token::Gt) => BinOp::Gt,
            Some(Token::Lt) => BinOp::Lt,
            Some(Token::Ge) => BinOp::Ge,
            Some(Token::Le) => BinOp::Le,
            Some(Token::In) => {
                self.advance();
                let right = self.parse_unary()?;
                return Ok(Expr::In {
                    element: Box::new(left),
                    collection: Box::new(right),
                });
            }
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_unary()?;
        Ok(Expr::BinOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    /// unary = "!" unary | primary
    fn parse_unary(&mut self) -> Result<Expr, PolicyError> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            let expr = self.parse_unary()?;
            return Ok(Expr::UnaryNot(Box::new(expr)));
        }
        self.parse_primary()
    }

    /// primary = literal | path | dns call | "(" expr ")"
    fn parse_primary(&mut self) -> Result<Expr, PolicyError> {
        match self.peek().cloned() {
            Some(Token::Int(n)) => {
                self.advance();
                Ok(Expr::Literal(Value::from(n)))
            }
            Some(Token::Float(f)) => {
                self.advance();
                Ok(Expr::Literal(Value::from(f)))
            }
            Some(Token::Str(s)) => {
                self.advance();
                Ok(Expr::Literal(Value::from(s)))
            }
            Some(Token::True) => {
                self.advance();
                Ok(Expr::Literal(Value::Bool(true)))
            }
            Some(Token::False) => {
                self.advance();
                Ok(Expr::Literal(Value::Bool(false)))
            }
            Some(Token::Ident(name)) => {
                self.advance();
                let mut path = vec![name];
                while self.peek() == Some(&Token::Dot) {
                    self.advance();
                    match self.advance() {
                        Some(Token::Ident(seg)) => path.push(seg),
                        _ => {
                            return Err(PolicyError::InvalidCondition(
                                "expected identifier after `.`".into(),
                            ));
                        }
                    }
                }
                if self.peek() == Some(&Token::LParen) {
                    let func = match (path.first().map(String::as_str), path.get(1).map(String::as_str), path.len()) {
                        (Some("dns"), Some("a"), 2) => DnsFunc::A,
                        (Some("dns"), Some("ptr"), 2) => DnsFunc::Ptr,
                        _ => {
                            return Err(PolicyError::InvalidCondition(format!(
                                "unknown function `{}`",
                                path.join(".")
                            )));
                        }
                    };
                    self.advance();
                    let arg = self.parse_expr()?;
                    self.expect_rparen()?;
                    if contains_dns_call(&arg) {
                        return Err(PolicyError::InvalidCondition(
                            "dns call arguments cannot themselves call dns".into(),
                        ));
                    }
                    return Ok(Expr::DnsCall {
                        func,
                        arg: Box::new(arg),
                    });
                }
                Ok(Expr::Path(path))
            }
            Some(Token::LParen) => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect_rparen()?;
                Ok(expr)
            }
            other => Err(PolicyError::InvalidCondition(format!(
                "unexpected token: {other:?}"
            ))),
        }
    }
}

/// Parse a condition expression string into an AST.
pub fn parse_condition(input: &str) -> Result<Expr, PolicyError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(PolicyError::InvalidCondition("empty expression".into()));
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_expr()?;
    if parser.pos < parser.tokens.len() {
        return Err(PolicyError::InvalidCondition(format!(
            "unexpected trailing token: {:?}",
            parser.tokens[parser.pos]
        )));
    }
    Ok(expr)
}

fn contains_dns_call(expr: &Expr) -> bool {
    match expr {
        Expr::DnsCall { .. } => true,
        Expr::Literal(_) | Expr::Path(_) => false,
        Expr::UnaryNot(inner) => contains_dns_call(inner),
        Expr::BinOp { left, right, .. } => contains_dns_call(left) || contains_dns_call(right),
        Expr::In {
            element,
            collection,
        } => contains_dns_call(element) || contains_dns_call(collection),
    }
}

/// Collect the `(function, argument)` pairs this expression will need, with
/// each argument evaluated against the context. Non-string arguments are
/// skipped here; evaluation reports them when the call site is reached.
pub fn dns_call_args(expr: &Expr, context: &Value) -> Vec<(DnsFunc, String)> {
    let mut out = Vec::new();
    collect_dns_args(expr, context, &mut out);
    out
}

fn collect_dns_args(expr: &Expr, context: &Value, out: &mut Vec<(DnsFunc, String)>) {
    match expr {
        Expr::DnsCall { func, arg } => {
            // Argument expressions are dns-free, so an empty table suffices.
            if let Ok(Value::String(s)) = evaluate_value(arg, context, &DnsTable::new()) {
                out.push((*func, s));
            }
        }
        Expr::Literal(_) | Expr::Path(_) => {}
        Expr::UnaryNot(inner) => collect_dns_args(inner, context, out),
        Expr::BinOp { left, right, .. } => {
            collect_dns_args(left, context, out);
            collect_dns_args(right, context, out);
        }
        Expr::In {
            element,
            collection,
        } => {
            collect_dns_args(element, context, out);
            collect_dns_args(collection, context, out);
        }
    }
}

// ─── Evaluator ──────────────────────────────────────────────────────────

/// Evaluate a condition to a boolean. Anything other than a boolean result
/// is an error; a missing path produces null, which is an error here and is
/// treated as "no match" by the rule evaluator.
pub fn evaluate_bool(expr: &Expr, context: &Value, dns: &DnsTable) -> Result<bool, PolicyError> {
    match evaluate_value(expr, context, dns)? {
        Value::Bool(b) => Ok(b),
        other => Err(PolicyError::InvalidCondition(format!(
            "condition must evaluate to boolean, got {other}"
        ))),
    }
}

/// Evaluate an expression to a JSON value.
pub fn evaluate_value(expr: &Expr, context: &Value, dns: &DnsTable) -> Result<Value, PolicyError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Path(segments) => {
            let mut current = context;
            for seg in segments {
                current = current.get(seg).unwrap_or(&Value::Null);
            }
            Ok(current.clone())
        }
        Expr::DnsCall { func, arg } => {
            let arg_value = evaluate_value(arg, context, dns)?;
            let Value::String(arg_str) = arg_value else {
                return Err(PolicyError::InvalidCondition(format!(
                    "{}: invalid argument (string required)",
                    func.name()
                )));
            };
            match dns.get(&(*func, arg_str.clone())) {
                Some(Ok(names)) => Ok(names.clone()),
                Some(Err(message)) => Err(PolicyError::InvalidCondition(message.clone())),
                None => Err(PolicyError::InvalidCondition(format!(
                    "{}({arg_str:?}): unresolved call",
                    func.name()
                ))),
            }
        }
        Expr::UnaryNot(inner) => match evaluate_value(inner, context, dns)? {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            _ => Err(PolicyError::InvalidCondition(
                "`!` operator requires a boolean operand".into(),
            )),
        },
        Expr::In {
            element,
            collection,
        } => {
            let elem = evaluate_value(element, context, dns)?;
            let coll = evaluate_value(collection, context, dns)?;
            let found = match (&elem, &coll) {
                (_, Value::Array(items)) => items.iter().any(|item| values_equal(item, &elem)),
                (Value::String(key), Value::Object(map)) => map.contains_key(key),
                (Value::String(needle), Value::String(haystack)) => haystack.contains(needle),
                _ => {
                    return Err(PolicyError::InvalidCondition(
                        "`in` requires an array, object or string on the right side".into(),
                    ))
                }
            };
            Ok(Value::Bool(found))
        }
        Expr::BinOp { op, left, right } => {
            let l = evaluate_value(left, context, dns)?;
            let r = evaluate_value(right, context, dns)?;
            match op {
                BinOp::And | BinOp::Or => match (&l, &r) {
                    (Value::Bool(a), Value::Bool(b)) => Ok(Value::Bool(if *op == BinOp::And {
                        *a && *b
                    } else {
                        *a || *b
                    })),
                    _ => Err(PolicyError::InvalidCondition(
                        "boolean operator requires boolean operands".into(),
                    )),
                },
                BinOp::Eq => Ok(Value::Bool(values_equal(&l, &r))),
                BinOp::Ne => Ok(Value::Bool(!values_equal(&l, &r))),
                BinOp::Gt | BinOp::Lt | BinOp::Ge | BinOp::Le => {
                    let (Some(lf), Some(rf)) = (l.as_f64(), r.as_f64()) else {
                        return Err(PolicyError::InvalidCondition(
                            "comparison operator requires numeric operands".into(),
                        ));
                    };
                    Ok(Value::Bool(match op {
                        BinOp::Gt => lf > rf,
                        BinOp::Lt => lf < rf,
                        BinOp::Ge => lf >= rf,
                        _ => lf <= rf,
                    }))
                }
            }
        }
    }
}

/// JSON equality with integer/float unification, so `storage.count == 3`
/// holds whether the stored number deserialized as i64 or f64.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(xf), Some(yf)) => xf == yf,
            _ => x == y,
        },
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(input: &str, ctx: &Value) -> bool {
        let expr = parse_condition(input).unwrap();
        evaluate_bool(&expr, ctx, &DnsTable::new()).unwrap()
    }

    #[test]
    fn test_parse_simple_comparison() {
        let expr = parse_condition("x == 5").unwrap();
        assert_eq!(
            expr,
            Expr::BinOp {
                op: BinOp::Eq,
                left: Box::new(Expr::Path(vec!["x".into()])),
                right: Box::new(Expr::Literal(json!(5))),
            }
        );
    }

    #[test]
    fn test_parse_dns_call() {
        let expr = parse_condition(r#""10.0.0.1" in dns.a("registry.internal")"#).unwrap();
        match expr {
            Expr::In { collection, .. } => match *collection {
                Expr::DnsCall {
                    func: DnsFunc::A, ..
                } => {}
                other => panic!("expected dns call, got {other:?}"),
            },
            other => panic!("expected In, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_unknown_function_rejected() {
        assert!(parse_condition("foo(1)").is_err());
        assert!(parse_condition("dns.srv(\"x\")").is_err());
    }

    #[test]
    fn test_parse_nested_dns_rejected() {
        assert!(parse_condition(r#"dns.a(dns.ptr("127.0.0.1"))"#).is_err());
    }

    #[test]
    fn test_evaluate_paths_and_operators() {
        let ctx = json!({ "input": { "method": "GET", "uri": "/v1.43/_ping" } });
        assert!(eval(r#"input.method == "GET""#, &ctx));
        assert!(eval(r#"input.method != "POST""#, &ctx));
        assert!(eval(r#""_ping" in input.uri"#, &ctx));
        assert!(!eval(r#"input.method == "POST" && "_ping" in input.uri"#, &ctx));
        assert!(eval(r#"(input.method == "POST") || ("_ping" in input.uri)"#, &ctx));
    }

    #[test]
    fn test_evaluate_in_array_and_object() {
        let ctx = json!({
            "input": {
                "headers": { "x-api-key": ["abc"] },
                "remote_addr_names": ["trusted.example.com."]
            }
        });
        assert!(eval(r#""x-api-key" in input.headers"#, &ctx));
        assert!(eval(
            r#""trusted.example.com." in input.remote_addr_names"#,
            &ctx
        ));
        assert!(!eval(r#""other.example.com." in input.remote_addr_names"#, &ctx));
    }

    #[test]
    fn test_missing_path_is_null_not_match() {
        let ctx = json!({ "input": {} });
        let expr = parse_condition(r#"input.method == "GET""#).unwrap();
        // null == "GET" is simply false, not an error
        assert!(!evaluate_bool(&expr, &ctx, &DnsTable::new()).unwrap());
        // but a bare missing path is a type error
        let expr = parse_condition("input.missing").unwrap();
        assert!(evaluate_bool(&expr, &ctx, &DnsTable::new()).is_err());
    }

    #[test]
    fn test_numeric_unification() {
        let ctx = json!({ "storage": { "count": 3.0 } });
        assert!(eval("storage.count == 3", &ctx));
        assert!(eval("storage.count >= 2", &ctx));
    }

    #[test]
    fn test_dns_table_lookup() {
        let expr = parse_condition(r#""10.1.2.3" in dns.a("registry.internal")"#).unwrap();
        let ctx = json!({});
        let mut dns = DnsTable::new();
        dns.insert(
            (DnsFunc::A, "registry.internal".into()),
            Ok(json!(["10.1.2.3"])),
        );
        assert!(evaluate_bool(&expr, &ctx, &dns).unwrap());

        let mut dns = DnsTable::new();
        dns.insert(
            (DnsFunc::A, "registry.internal".into()),
            Err("dns.a: error: no such host".into()),
        );
        assert!(evaluate_bool(&expr, &ctx, &dns).is_err());
    }

    #[test]
    fn test_dns_call_args_collection() {
        let expr =
            parse_condition(r#"input.remote_addr in dns.a("host.example") || dns.ptr(input.original_ip) == input.names"#)
                .unwrap();
        let ctx = json!({ "input": { "original_ip": "192.0.2.7" } });
        let args = dns_call_args(&expr, &ctx);
        assert!(args.contains(&(DnsFunc::A, "host.example".to_string())));
        assert!(args.contains(&(DnsFunc::Ptr, "192.0.2.7".to_string())));
    }
}
