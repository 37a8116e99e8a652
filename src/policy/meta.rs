//! The two fixed rule sources every evaluator is compiled with: the
//! meta-policy, which classifies loaded policies as well-formed or invalid,
//! and the query, which turns per-request policy outcomes into the final
//! decision record. Both are constants of the daemon; user policies cannot
//! override them, and the reflection endpoints serve them verbatim.

use std::collections::{BTreeMap, BTreeSet};

use kdl::KdlDocument;
use serde::Serialize;
use serde_json::Value;

use crate::policy::errors::PolicyError;

/// Classifies every loaded policy under the `docker_socket_authorizer`
/// namespace. A policy is well-formed when it produces a result in the
/// declared set together with a non-empty message; a `to_store` value, when
/// present, must be an object.
pub const META_POLICY: &str = r#"meta-policy namespace="docker_socket_authorizer" {
    valid-results "allow" "deny" "skip"
    require-message
    storage field="to_store" type="object"
    ok {
        no-invalid-policies
        no-invalid-storage
        some-ok-policy
    }
}
"#;

/// The per-request query. Binds the named outputs, requires all five `ok`
/// conditions to hold, and asserts the partition identity over all policies
/// as a safety net independent of the meta-policy.
pub const QUERY: &str = r#"query {
    output "denies" result="deny"
    output "allows" result="allow"
    output "skips" result="skip"
    output "invalid_policies"
    output "invalid_storage"
    output "all_policies"
    output "meta_policy_ok"
    output "to_store"
    output "ok"
    ok {
        meta-policy-ok
        no-invalid-policies
        no-invalid-storage
        no-denies
        some-allow
    }
    assert-partition whole="all_policies" {
        part "denies"
        part "allows"
        part "skips"
        part "invalid_policies"
    }
}
"#;

/// What a single policy produced for one evaluation: a result keyword, a
/// message, and optionally a storage value. `None` fields mean the policy
/// failed to produce that output.
#[derive(Debug, Clone, Default)]
pub struct PolicyOutcome {
    pub result: Option<String>,
    pub message: Option<String>,
    pub to_store: Option<Value>,
}

/// The meta-policy's classification of a full set of policy outcomes.
#[derive(Debug, Clone, Serialize)]
pub struct Classification {
    pub all_policies: BTreeSet<String>,
    pub allow_policies: BTreeMap<String, String>,
    pub deny_policies: BTreeMap<String, String>,
    pub skip_policies: BTreeMap<String, String>,
    pub invalid_policies: BTreeSet<String>,
    pub invalid_storage: BTreeSet<String>,
    pub ok: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetaOkCondition {
    NoInvalidPolicies,
    NoInvalidStorage,
    SomeOkPolicy,
}

/// Parsed form of [`META_POLICY`]. The classifier is driven entirely by this
/// structure so that the published source is the actual contract.
#[derive(Debug, Clone)]
pub struct MetaPolicy {
    pub namespace: String,
    valid_results: Vec<String>,
    require_message: bool,
    storage_field: String,
    ok_conditions: Vec<MetaOkCondition>,
}

impl MetaPolicy {
    pub fn parse(source: &str) -> Result<Self, PolicyError> {
        let doc: KdlDocument = source
            .parse()
            .map_err(|e: kdl::KdlError| PolicyError::BuiltinSource(e.to_string()))?;
        let node = doc
            .nodes()
            .iter()
            .find(|n| n.name().value() == "meta-policy")
            .ok_or_else(|| PolicyError::BuiltinSource("missing meta-policy node".into()))?;

        let namespace = node
            .get("namespace")
            .and_then(|v| v.value().as_string())
            .ok_or_else(|| PolicyError::BuiltinSource("meta-policy requires a namespace".into()))?
            .to_string();

        let mut valid_results = Vec::new();
        let mut require_message = false;
        let mut storage_field = String::new();
        let mut ok_conditions = Vec::new();

        let children = node
            .children()
            .ok_or_else(|| PolicyError::BuiltinSource("meta-policy has no body".into()))?;
        for child in children.nodes() {
            match child.name().value() {
                "valid-results" => valid_results = string_args(child),
                "require-message" => require_message = true,
                "storage" => {
                    storage_field = child
                        .get("field")
                        .and_then(|v| v.value().as_string())
                        .unwrap_or("to_store")
                        .to_string();
                }
                "ok" => {
                    let body = child.children().ok_or_else(|| {
                        PolicyError::BuiltinSource("meta-policy ok block is empty".into())
                    })?;
                    for cond in body.nodes() {
                        ok_conditions.push(match cond.name().value() {
                            "no-invalid-policies" => MetaOkCondition::NoInvalidPolicies,
                            "no-invalid-storage" => MetaOkCondition::NoInvalidStorage,
                            "some-ok-policy" => MetaOkCondition::SomeOkPolicy,
                            other => {
                                return Err(PolicyError::BuiltinSource(format!(
                                    "unknown meta-policy ok condition `{other}`"
                                )))
                            }
                        });
                    }
                }
                other => {
                    return Err(PolicyError::BuiltinSource(format!(
                        "unknown meta-policy construct `{other}`"
                    )))
                }
            }
        }

        if valid_results.is_empty() {
            return Err(PolicyError::BuiltinSource(
                "meta-policy declares no valid results".into(),
            ));
        }

        Ok(Self {
            namespace,
            valid_results,
            require_message,
            storage_field,
            ok_conditions,
        })
    }

    pub fn storage_field(&self) -> &str {
        &self.storage_field
    }

    /// Classify one evaluation's outcomes. Every policy lands in exactly one
    /// of the result buckets or in `invalid_policies`; `invalid_storage` is
    /// tracked independently.
    pub fn classify(&self, outcomes: &BTreeMap<String, PolicyOutcome>) -> Classification {
        let mut all_policies = BTreeSet::new();
        let mut allow_policies = BTreeMap::new();
        let mut deny_policies = BTreeMap::new();
        let mut skip_policies = BTreeMap::new();
        let mut invalid_policies = BTreeSet::new();
        let mut invalid_storage = BTreeSet::new();
        let mut ok_count = 0usize;

        for (name, outcome) in outcomes {
            all_policies.insert(name.clone());

            let message = outcome.message.as_deref().unwrap_or("");
            let message_ok = !self.require_message || !message.is_empty();
            let result = outcome.result.as_deref();
            let result_valid =
                result.is_some_and(|r| self.valid_results.iter().any(|v| v.as_str() == r));

            match result {
                Some(result) if result_valid && message_ok => {
                    ok_count += 1;
                    let entry = (name.clone(), message.to_string());
                    match result {
                        "allow" => allow_policies.insert(entry.0, entry.1),
                        "deny" => deny_policies.insert(entry.0, entry.1),
                        _ => skip_policies.insert(entry.0, entry.1),
                    };
                }
                _ => {
                    invalid_policies.insert(name.clone());
                }
            }

            if let Some(stored) = &outcome.to_store {
                if !stored.is_object() {
                    invalid_storage.insert(name.clone());
                }
            }
        }

        let ok = self.ok_conditions.iter().all(|cond| match cond {
            MetaOkCondition::NoInvalidPolicies => invalid_policies.is_empty(),
            MetaOkCondition::NoInvalidStorage => invalid_storage.is_empty(),
            MetaOkCondition::SomeOkPolicy => ok_count > 0,
        });

        Classification {
            all_policies,
            allow_policies,
            deny_policies,
            skip_policies,
            invalid_policies,
            invalid_storage,
            ok,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueryOkCondition {
    MetaPolicyOk,
    NoInvalidPolicies,
    NoInvalidStorage,
    NoDenies,
    SomeAllow,
}

/// Parsed form of [`QUERY`].
#[derive(Debug, Clone)]
pub struct Query {
    pub outputs: Vec<String>,
    ok_conditions: Vec<QueryOkCondition>,
    partition_whole: String,
    partition_parts: Vec<String>,
}

impl Query {
    pub fn parse(source: &str) -> Result<Self, PolicyError> {
        let doc: KdlDocument = source
            .parse()
            .map_err(|e: kdl::KdlError| PolicyError::BuiltinSource(e.to_string()))?;
        let node = doc
            .nodes()
            .iter()
            .find(|n| n.name().value() == "query")
            .ok_or_else(|| PolicyError::BuiltinSource("missing query node".into()))?;

        let mut outputs = Vec::new();
        let mut ok_conditions = Vec::new();
        let mut partition_whole = String::new();
        let mut partition_parts = Vec::new();

        let children = node
            .children()
            .ok_or_else(|| PolicyError::BuiltinSource("query has no body".into()))?;
        for child in children.nodes() {
            match child.name().value() {
                "output" => {
                    let name = first_string_arg(child).ok_or_else(|| {
                        PolicyError::BuiltinSource("query output requires a name".into())
                    })?;
                    outputs.push(name);
                }
                "ok" => {
                    let body = child.children().ok_or_else(|| {
                        PolicyError::BuiltinSource("query ok block is empty".into())
                    })?;
                    for cond in body.nodes() {
                        ok_conditions.push(match cond.name().value() {
                            "meta-policy-ok" => QueryOkCondition::MetaPolicyOk,
                            "no-invalid-policies" => QueryOkCondition::NoInvalidPolicies,
                            "no-invalid-storage" => QueryOkCondition::NoInvalidStorage,
                            "no-denies" => QueryOkCondition::NoDenies,
                            "some-allow" => QueryOkCondition::SomeAllow,
                            other => {
                                return Err(PolicyError::BuiltinSource(format!(
                                    "unknown query ok condition `{other}`"
                                )))
                            }
                        });
                    }
                }
                "assert-partition" => {
                    partition_whole = child
                        .get("whole")
                        .and_then(|v| v.value().as_string())
                        .ok_or_else(|| {
                            PolicyError::BuiltinSource("assert-partition requires whole=".into())
                        })?
                        .to_string();
                    let body = child.children().ok_or_else(|| {
                        PolicyError::BuiltinSource("assert-partition has no parts".into())
                    })?;
                    for part in body.nodes() {
                        if part.name().value() != "part" {
                            return Err(PolicyError::BuiltinSource(format!(
                                "unknown assert-partition construct `{}`",
                                part.name().value()
                            )));
                        }
                        partition_parts.push(first_string_arg(part).ok_or_else(|| {
                            PolicyError::BuiltinSource("partition part requires a name".into())
                        })?);
                    }
                }
                other => {
                    return Err(PolicyError::BuiltinSource(format!(
                        "unknown query construct `{other}`"
                    )))
                }
            }
        }

        if ok_conditions.is_empty() {
            return Err(PolicyError::BuiltinSource(
                "query declares no ok conditions".into(),
            ));
        }

        Ok(Self {
            outputs,
            ok_conditions,
            partition_whole,
            partition_parts,
        })
    }

    /// The query-level partition identity: every policy must land in exactly
    /// one of the declared parts. A violation means the classifier itself is
    /// broken, so it surfaces as an evaluation failure rather than a denial.
    pub fn check_partition(&self, c: &Classification) -> Result<(), PolicyError> {
        let whole = c.all_policies.len();
        let parts = c.deny_policies.len()
            + c.allow_policies.len()
            + c.skip_policies.len()
            + c.invalid_policies.len();
        if whole != parts {
            return Err(PolicyError::EvalFailed(format!(
                "partition identity violated: |{}| = {} but |{}| = {}",
                self.partition_whole,
                whole,
                self.partition_parts.join("| + |"),
                parts,
            )));
        }
        Ok(())
    }

    pub fn decide_ok(&self, meta_policy_ok: bool, c: &Classification) -> bool {
        self.ok_conditions.iter().all(|cond| match cond {
            QueryOkCondition::MetaPolicyOk => meta_policy_ok,
            QueryOkCondition::NoInvalidPolicies => c.invalid_policies.is_empty(),
            QueryOkCondition::NoInvalidStorage => c.invalid_storage.is_empty(),
            QueryOkCondition::NoDenies => c.deny_policies.is_empty(),
            QueryOkCondition::SomeAllow => !c.allow_policies.is_empty(),
        })
    }
}

fn first_string_arg(node: &kdl::KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn string_args(node: &kdl::KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outcome(result: &str, message: &str) -> PolicyOutcome {
        PolicyOutcome {
            result: Some(result.to_string()),
            message: Some(message.to_string()),
            to_store: None,
        }
    }

    #[test]
    fn test_builtin_sources_parse() {
        let meta = MetaPolicy::parse(META_POLICY).unwrap();
        assert_eq!(meta.namespace, "docker_socket_authorizer");
        assert_eq!(meta.storage_field(), "to_store");

        let query = Query::parse(QUERY).unwrap();
        assert_eq!(query.outputs.len(), 9);
        assert!(query.outputs.iter().any(|o| o == "meta_policy_ok"));
    }

    #[test]
    fn test_classify_buckets_by_result() {
        let meta = MetaPolicy::parse(META_POLICY).unwrap();
        let mut outcomes = BTreeMap::new();
        outcomes.insert("a".to_string(), outcome("allow", "yes"));
        outcomes.insert("d".to_string(), outcome("deny", "no"));
        outcomes.insert("s".to_string(), outcome("skip", "n/a"));

        let c = meta.classify(&outcomes);
        assert_eq!(c.allow_policies.get("a").map(String::as_str), Some("yes"));
        assert_eq!(c.deny_policies.get("d").map(String::as_str), Some("no"));
        assert_eq!(c.skip_policies.get("s").map(String::as_str), Some("n/a"));
        assert!(c.invalid_policies.is_empty());
        assert!(c.ok);
    }

    #[test]
    fn test_classify_missing_message_is_invalid_once() {
        let meta = MetaPolicy::parse(META_POLICY).unwrap();
        let mut outcomes = BTreeMap::new();
        outcomes.insert(
            "broken".to_string(),
            PolicyOutcome {
                result: Some("allow".to_string()),
                message: None,
                to_store: None,
            },
        );
        outcomes.insert("fine".to_string(), outcome("allow", "ok"));

        let c = meta.classify(&outcomes);
        assert_eq!(c.invalid_policies.iter().collect::<Vec<_>>(), ["broken"]);
        assert!(!c.allow_policies.contains_key("broken"));
        assert!(!c.ok);
    }

    #[test]
    fn test_classify_unknown_result_is_invalid() {
        let meta = MetaPolicy::parse(META_POLICY).unwrap();
        let mut outcomes = BTreeMap::new();
        outcomes.insert("odd".to_string(), outcome("maybe", "hmm"));

        let c = meta.classify(&outcomes);
        assert!(c.invalid_policies.contains("odd"));
        assert!(!c.ok);
    }

    #[test]
    fn test_classify_non_object_storage() {
        let meta = MetaPolicy::parse(META_POLICY).unwrap();
        let mut outcomes = BTreeMap::new();
        outcomes.insert(
            "p".to_string(),
            PolicyOutcome {
                result: Some("allow".to_string()),
                message: Some("ok".to_string()),
                to_store: Some(json!("not an object")),
            },
        );

        let c = meta.classify(&outcomes);
        assert!(c.invalid_storage.contains("p"));
        // Still a well-formed allow; storage validity is tracked separately.
        assert!(c.allow_policies.contains_key("p"));
        assert!(!c.ok);
    }

    #[test]
    fn test_classify_empty_set_is_not_ok() {
        let meta = MetaPolicy::parse(META_POLICY).unwrap();
        let c = meta.classify(&BTreeMap::new());
        assert!(!c.ok);
    }

    #[test]
    fn test_query_ok_needs_all_five_conditions() {
        let meta = MetaPolicy::parse(META_POLICY).unwrap();
        let query = Query::parse(QUERY).unwrap();

        let mut outcomes = BTreeMap::new();
        outcomes.insert("a".to_string(), outcome("allow", "yes"));
        outcomes.insert("d".to_string(), outcome("deny", "no"));
        let c = meta.classify(&outcomes);
        assert!(!query.decide_ok(c.ok, &c));

        let mut outcomes = BTreeMap::new();
        outcomes.insert("a".to_string(), outcome("allow", "yes"));
        let c = meta.classify(&outcomes);
        assert!(query.decide_ok(c.ok, &c));
    }

    #[test]
    fn test_partition_identity_holds_for_classifier_output() {
        let meta = MetaPolicy::parse(META_POLICY).unwrap();
        let query = Query::parse(QUERY).unwrap();

        let mut outcomes = BTreeMap::new();
        outcomes.insert("a".to_string(), outcome("allow", "yes"));
        outcomes.insert("d".to_string(), outcome("deny", "no"));
        outcomes.insert("s".to_string(), outcome("skip", "n/a"));
        outcomes.insert("x".to_string(), outcome("bogus", "m"));

        let c = meta.classify(&outcomes);
        query.check_partition(&c).unwrap();
        assert_eq!(c.all_policies.len(), 4);
    }
}
