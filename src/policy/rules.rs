//! Parsing of user policy files.
//!
//! A policy file holds one or more `policy` nodes:
//!
//! ```kdl
//! policy "deny_container_stop" {
//!     default result="skip" message="does not apply"
//!     rule result="deny" message="stopping containers is not permitted" {
//!         when "input.method == \"POST\""
//!         when "\"/stop\" in input.uri"
//!     }
//!     remember key="last_uri" value="input.uri"
//! }
//! ```
//!
//! Rules are ordered; the first rule whose conditions all hold supplies the
//! policy's result and message, with `default` as the fallback. Conditions
//! are compiled at load time; result keywords are deliberately not validated
//! here; that is the meta-policy's job.

use kdl::{KdlDocument, KdlNode};

use crate::policy::condition::{self, Expr};
use crate::policy::errors::PolicyError;

/// One fully parsed policy, conditions compiled.
#[derive(Debug, Clone)]
pub struct PolicyModule {
    pub name: String,
    /// File the policy came from, for the load log line.
    pub source_file: String,
    pub default: Option<RuleOutcome>,
    pub rules: Vec<Rule>,
    pub remember: Vec<Remember>,
    /// Wholesale `to-store` expression; overrides `remember` entries.
    pub store_expr: Option<Expr>,
    pub prints: Vec<Expr>,
}

#[derive(Debug, Clone)]
pub struct RuleOutcome {
    pub result: String,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub outcome: RuleOutcome,
    pub conditions: Vec<Expr>,
}

#[derive(Debug, Clone)]
pub struct Remember {
    pub key: String,
    pub value: Expr,
}

/// Parse a policy file into its policy modules.
pub fn parse_policy_document(source: &str, path: &str) -> Result<Vec<PolicyModule>, PolicyError> {
    let doc: KdlDocument = source.parse().map_err(|e: kdl::KdlError| PolicyError::KdlParse {
        path: path.to_string(),
        message: e.to_string(),
    })?;

    let mut modules = Vec::new();

    for node in doc.nodes() {
        if node.name().value() != "policy" {
            return Err(PolicyError::KdlParse {
                path: path.to_string(),
                message: format!(
                    "unexpected top-level node `{}` (expected `policy`)",
                    node.name().value()
                ),
            });
        }
        modules.push(parse_policy_node(node, path)?);
    }

    Ok(modules)
}

fn parse_policy_node(node: &KdlNode, path: &str) -> Result<PolicyModule, PolicyError> {
    let name = first_string_arg(node).ok_or_else(|| PolicyError::KdlParse {
        path: path.to_string(),
        message: "policy node requires a string argument (e.g. policy \"allow_ping\")".into(),
    })?;

    let mut module = PolicyModule {
        name: name.clone(),
        source_file: path.to_string(),
        default: None,
        rules: Vec::new(),
        remember: Vec::new(),
        store_expr: None,
        prints: Vec::new(),
    };

    let Some(children) = node.children() else {
        return Ok(module);
    };

    for child in children.nodes() {
        match child.name().value() {
            "default" => {
                if module.default.is_some() {
                    return Err(invalid(&name, "multiple `default` nodes"));
                }
                module.default = Some(parse_outcome(child, &name)?);
            }
            "rule" => {
                let outcome = parse_outcome(child, &name)?;
                let mut conditions = Vec::new();
                if let Some(body) = child.children() {
                    for when in body.nodes() {
                        if when.name().value() != "when" {
                            return Err(invalid(
                                &name,
                                &format!(
                                    "unexpected child `{}` in rule (expected `when`)",
                                    when.name().value()
                                ),
                            ));
                        }
                        let raw = first_string_arg(when)
                            .ok_or_else(|| invalid(&name, "`when` requires an expression string"))?;
                        conditions.push(condition::parse_condition(&raw)?);
                    }
                }
                if conditions.is_empty() {
                    return Err(invalid(&name, "rule has no `when` conditions (use `default`)"));
                }
                module.rules.push(Rule { outcome, conditions });
            }
            "remember" => {
                let key = child
                    .get("key")
                    .and_then(|v| v.value().as_string())
                    .ok_or_else(|| invalid(&name, "`remember` requires key=\"...\""))?
                    .to_string();
                let raw = child
                    .get("value")
                    .and_then(|v| v.value().as_string())
                    .ok_or_else(|| invalid(&name, "`remember` requires value=\"expr\""))?;
                module.remember.push(Remember {
                    key,
                    value: condition::parse_condition(raw)?,
                });
            }
            "to-store" => {
                if module.store_expr.is_some() {
                    return Err(invalid(&name, "multiple `to-store` nodes"));
                }
                let raw = first_string_arg(child)
                    .ok_or_else(|| invalid(&name, "`to-store` requires an expression string"))?;
                module.store_expr = Some(condition::parse_condition(&raw)?);
            }
            "print" => {
                let raw = first_string_arg(child)
                    .ok_or_else(|| invalid(&name, "`print` requires an expression string"))?;
                module.prints.push(condition::parse_condition(&raw)?);
            }
            other => {
                return Err(invalid(&name, &format!("unexpected construct `{other}`")));
            }
        }
    }

    Ok(module)
}

fn parse_outcome(node: &KdlNode, policy: &str) -> Result<RuleOutcome, PolicyError> {
    let result = node
        .get("result")
        .and_then(|v| v.value().as_string())
        .ok_or_else(|| invalid(policy, "missing result=\"allow|deny|skip\""))?
        .to_string();
    // An absent message still parses; the meta-policy classifies the policy
    // invalid when it surfaces.
    let message = node
        .get("message")
        .and_then(|v| v.value().as_string())
        .unwrap_or("")
        .to_string();
    Ok(RuleOutcome { result, message })
}

fn invalid(policy: &str, message: &str) -> PolicyError {
    PolicyError::InvalidPolicy {
        policy: policy.to_string(),
        message: message.to_string(),
    }
}

fn first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}
