//! The evaluator: an immutable bundle of compiled policies, the fixed
//! meta-policy and query, and a private storage instance. Built once per
//! (re)load and published by atomic swap; requests capture a pointer and use
//! that one evaluator for both evaluation and storage write-back.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::dns;
use crate::policy::condition::{self, DnsFunc, DnsTable, Expr};
use crate::policy::errors::PolicyError;
use crate::policy::meta::{MetaPolicy, PolicyOutcome, Query, META_POLICY, QUERY};
use crate::policy::rules::PolicyModule;
use crate::settings::Settings;

/// The output record of a single evaluation.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub ok: bool,
    pub meta_policy_ok: bool,
    pub all_policies: BTreeSet<String>,
    pub denies: BTreeMap<String, String>,
    pub allows: BTreeMap<String, String>,
    pub skips: BTreeMap<String, String>,
    pub invalid_policies: BTreeSet<String>,
    pub invalid_storage: BTreeSet<String>,
    pub to_store: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PrintSink {
    Stdout,
    Stderr,
    Disabled,
}

impl PrintSink {
    fn from_setting(value: &str) -> Self {
        match value {
            "stdout" => PrintSink::Stdout,
            "stderr" => PrintSink::Stderr,
            "" | "none" => PrintSink::Disabled,
            other => {
                tracing::warn!(
                    print_to = other,
                    "Unsupported policy.print_to configuration value; defaulting to stdout"
                );
                PrintSink::Stdout
            }
        }
    }

    fn write(&self, policy: &str, value: &Value) {
        match self {
            PrintSink::Stdout => println!("{policy}: {value}"),
            PrintSink::Stderr => eprintln!("{policy}: {value}"),
            PrintSink::Disabled => {}
        }
    }
}

#[derive(Debug)]
pub struct Evaluator {
    meta: MetaPolicy,
    query: Query,
    modules: BTreeMap<String, PolicyModule>,
    store: crate::policy::store::Store,
    policy_names: Vec<String>,
    strict: bool,
    print_sink: PrintSink,
    // dns.a / dns.ptr are memoized for the evaluator's lifetime.
    dns_cache: Mutex<DnsTable>,
}

impl Evaluator {
    /// Build an evaluator from parsed policy modules.
    ///
    /// Compiles the built-in meta-policy and query, runs the static
    /// meta-policy check (each policy classified against an empty input,
    /// leniently and without DNS, since structure is what is being validated,
    /// not request reachability), seeds storage with an empty object per
    /// policy, and commits. Any failure before the commit aborts the
    /// seeding transaction and nothing is published.
    pub fn new(modules: Vec<PolicyModule>, settings: &Settings) -> Result<Self, PolicyError> {
        let store = crate::policy::store::Store::new();
        let mut tx = store.begin_write();

        let meta = MetaPolicy::parse(META_POLICY)?;
        let query = Query::parse(QUERY)?;

        let print_sink = PrintSink::from_setting(&settings.policy.print_to);
        let mut by_name = BTreeMap::new();
        for mut module in modules {
            if print_sink == PrintSink::Disabled {
                module.prints.clear();
            }
            let name = module.name.clone();
            if by_name.insert(name.clone(), module).is_some() {
                return Err(PolicyError::DuplicatePolicy(name));
            }
        }

        // Static meta-policy check against an empty input.
        let empty_input = Value::Object(Default::default());
        let mut outcomes = BTreeMap::new();
        for (name, module) in &by_name {
            let ctx = evaluation_context(&empty_input, &Value::Object(Default::default()));
            let outcome = evaluate_module(module, &ctx, &DnsTable::new(), false, PrintSink::Disabled)?;
            outcomes.insert(name.clone(), outcome);
        }
        // An empty policy set is a valid deployment (it denies everything);
        // the meta check fails construction only for ill-formed policies.
        let classification = meta.classify(&outcomes);
        if !classification.ok && !by_name.is_empty() {
            let details = serde_json::to_string(&classification)
                .unwrap_or_else(|_| format!("{classification:?}"));
            return Err(PolicyError::MetaPolicyFailed { details });
        }

        let policy_names: Vec<String> = by_name.keys().cloned().collect();
        for name in &policy_names {
            tx.write(name, Value::Object(Default::default()))?;
        }
        tx.commit();

        Ok(Self {
            meta,
            query,
            modules: by_name,
            store,
            policy_names,
            strict: settings.policy.strict_mode,
            print_sink,
            dns_cache: Mutex::new(DnsTable::new()),
        })
    }

    pub fn policy_names(&self) -> &[String] {
        &self.policy_names
    }

    /// Evaluate the query against one request input. Runs the prepared
    /// policies exactly once; never retries.
    pub async fn evaluate(&self, input: &Value) -> Result<Decision, PolicyError> {
        // Per-policy contexts first, so dns argument expressions can read
        // both the input and the policy's own storage.
        let mut contexts = BTreeMap::new();
        let mut needs = BTreeSet::new();
        for (name, module) in &self.modules {
            let ctx = evaluation_context(input, &self.store.read(name));
            for expr in module_expressions(module) {
                needs.extend(condition::dns_call_args(expr, &ctx));
            }
            contexts.insert(name.clone(), ctx);
        }
        let dns_table = self.resolve_dns(needs).await;

        let mut outcomes = BTreeMap::new();
        for (name, module) in &self.modules {
            let ctx = &contexts[name];
            let outcome = evaluate_module(module, ctx, &dns_table, self.strict, self.print_sink)?;
            outcomes.insert(name.clone(), outcome);
        }

        let classification = self.meta.classify(&outcomes);
        self.query.check_partition(&classification)?;
        let meta_policy_ok = classification.ok;
        let ok = self.query.decide_ok(meta_policy_ok, &classification);

        let mut to_store = BTreeMap::new();
        for (name, outcome) in &outcomes {
            if let Some(value) = &outcome.to_store {
                if value.is_object() {
                    to_store.insert(name.clone(), value.clone());
                }
            }
        }

        Ok(Decision {
            ok,
            meta_policy_ok,
            all_policies: classification.all_policies,
            denies: classification.deny_policies,
            allows: classification.allow_policies,
            skips: classification.skip_policies,
            invalid_policies: classification.invalid_policies,
            invalid_storage: classification.invalid_storage,
            to_store,
        })
    }

    /// Persist per-policy state produced by a decision.
    ///
    /// When this evaluator has been replaced as the active one, the write is
    /// silently discarded: a reload resets storage wholesale, so a stale
    /// write is safe to drop. That is the storage contract policies sign up
    /// for.
    pub fn write_back(
        self: &Arc<Self>,
        to_store: &BTreeMap<String, Value>,
    ) -> Result<(), PolicyError> {
        if !crate::policy::loader::is_active(self) {
            return Ok(());
        }

        let mut tx = self.store.begin_write();
        for (policy, value) in to_store {
            tx.write(policy, value.clone())?;
        }
        tx.commit();
        Ok(())
    }

    /// Stored object for one policy; visible for white-box tests.
    pub fn stored(&self, policy: &str) -> Value {
        self.store.read(policy)
    }

    async fn resolve_dns(&self, needs: BTreeSet<(DnsFunc, String)>) -> DnsTable {
        let mut cache = self.dns_cache.lock().await;
        let mut table = DnsTable::new();
        for (func, arg) in needs {
            let entry = match cache.get(&(func, arg.clone())) {
                Some(cached) => cached.clone(),
                None => {
                    let fresh = match func {
                        DnsFunc::A => dns::lookup_a(&arg).await,
                        DnsFunc::Ptr => dns::lookup_ptr(&arg).await,
                    }
                    .map(|names| Value::from(names));
                    cache.insert((func, arg.clone()), fresh.clone());
                    fresh
                }
            };
            table.insert((func, arg), entry);
        }
        table
    }
}

fn evaluation_context(input: &Value, storage: &Value) -> Value {
    serde_json::json!({ "input": input, "storage": storage })
}

fn module_expressions(module: &PolicyModule) -> impl Iterator<Item = &Expr> {
    module
        .rules
        .iter()
        .flat_map(|rule| rule.conditions.iter())
        .chain(module.remember.iter().map(|r| &r.value))
        .chain(module.store_expr.iter())
        .chain(module.prints.iter())
}

/// Run one policy against a context: first matching rule wins, `default`
/// otherwise. In strict mode a condition or storage expression error fails
/// the whole evaluation; otherwise the rule simply does not match.
fn evaluate_module(
    module: &PolicyModule,
    ctx: &Value,
    dns: &DnsTable,
    strict: bool,
    print_sink: PrintSink,
) -> Result<PolicyOutcome, PolicyError> {
    let mut chosen = None;
    'rules: for rule in &module.rules {
        for cond in &rule.conditions {
            match condition::evaluate_bool(cond, ctx, dns) {
                Ok(true) => {}
                Ok(false) => continue 'rules,
                Err(error) if strict => {
                    return Err(PolicyError::EvalFailed(format!(
                        "policy `{}`: {error}",
                        module.name
                    )))
                }
                Err(error) => {
                    tracing::debug!(policy = %module.name, %error, "Condition error; rule not matched");
                    continue 'rules;
                }
            }
        }
        chosen = Some(&rule.outcome);
        break;
    }
    let outcome = chosen.or(module.default.as_ref());

    let to_store = if let Some(expr) = &module.store_expr {
        match condition::evaluate_value(expr, ctx, dns) {
            Ok(value) => Some(value),
            Err(error) if strict => {
                return Err(PolicyError::EvalFailed(format!(
                    "policy `{}` to-store: {error}",
                    module.name
                )))
            }
            Err(error) => {
                tracing::debug!(policy = %module.name, %error, "to-store expression error");
                None
            }
        }
    } else if !module.remember.is_empty() {
        let mut map = serde_json::Map::new();
        for remember in &module.remember {
            match condition::evaluate_value(&remember.value, ctx, dns) {
                Ok(value) => {
                    map.insert(remember.key.clone(), value);
                }
                Err(error) if strict => {
                    return Err(PolicyError::EvalFailed(format!(
                        "policy `{}` remember `{}`: {error}",
                        module.name, remember.key
                    )))
                }
                Err(error) => {
                    tracing::debug!(policy = %module.name, key = %remember.key, %error, "remember expression error")
                }
            }
        }
        Some(Value::Object(map))
    } else {
        None
    };

    for print in &module.prints {
        if let Ok(value) = condition::evaluate_value(print, ctx, dns) {
            print_sink.write(&module.name, &value);
        }
    }

    Ok(PolicyOutcome {
        result: outcome.map(|o| o.result.clone()),
        message: outcome.map(|o| o.message.clone()),
        to_store,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::rules::parse_policy_document;
    use serde_json::json;

    fn settings() -> Settings {
        Settings::default()
    }

    fn modules(source: &str) -> Vec<PolicyModule> {
        parse_policy_document(source, "test.kdl").unwrap()
    }

    fn input(method: &str, uri: &str) -> Value {
        json!({ "method": method, "uri": uri, "headers": {}, "body": "" })
    }

    #[tokio::test]
    async fn test_no_policies_constructs_but_never_approves() {
        let ev = Evaluator::new(Vec::new(), &settings()).unwrap();
        let decision = ev.evaluate(&input("GET", "/")).await.unwrap();
        assert!(!decision.ok);
        assert!(!decision.meta_policy_ok);
        assert!(decision.all_policies.is_empty());
    }

    #[tokio::test]
    async fn test_write_back_persists_only_while_active() {
        let source = r#"
policy "counter" {
    default result="allow" message="ok"
    remember key="last_uri" value="input.uri"
}
"#;
        let ev = Arc::new(Evaluator::new(modules(source), &settings()).unwrap());
        crate::policy::loader::publish_for_tests(ev.clone());

        let decision = ev.evaluate(&input("GET", "/v1/info")).await.unwrap();
        ev.write_back(&decision.to_store).unwrap();
        assert_eq!(ev.stored("counter"), json!({"last_uri": "/v1/info"}));

        // Replace the active evaluator; the old pointer's writes are now
        // discarded without error.
        let replacement = Arc::new(Evaluator::new(modules(source), &settings()).unwrap());
        crate::policy::loader::publish_for_tests(replacement.clone());
        let decision = ev.evaluate(&input("GET", "/v2/info")).await.unwrap();
        ev.write_back(&decision.to_store).unwrap();
        assert_eq!(ev.stored("counter"), json!({"last_uri": "/v1/info"}));
        assert_eq!(replacement.stored("counter"), json!({}));
    }

    #[tokio::test]
    async fn test_single_allow_policy_approves() {
        let ev = Evaluator::new(
            modules(r#"policy "allow_all" { default result="allow" message="ok"; }"#),
            &settings(),
        )
        .unwrap();
        let decision = ev.evaluate(&input("GET", "/_ping")).await.unwrap();
        assert!(decision.ok);
        assert!(decision.meta_policy_ok);
        assert_eq!(decision.allows.get("allow_all").map(String::as_str), Some("ok"));
        assert!(decision.denies.is_empty());
    }

    #[tokio::test]
    async fn test_deny_beats_allow() {
        let ev = Evaluator::new(
            modules(
                r#"
policy "allow_all" { default result="allow" message="ok"; }
policy "deny_all" { default result="deny" message="no"; }
"#,
            ),
            &settings(),
        )
        .unwrap();
        let decision = ev.evaluate(&input("GET", "/")).await.unwrap();
        assert!(!decision.ok);
        assert_eq!(decision.denies.len(), 1);
        assert_eq!(decision.allows.len(), 1);
    }

    #[tokio::test]
    async fn test_rules_match_on_input() {
        let ev = Evaluator::new(
            modules(
                r#"
policy "allow_ping" {
    default result="skip" message="not a ping"
    rule result="allow" message="ping is fine" {
        when "input.method == \"GET\""
        when "\"_ping\" in input.uri"
    }
}
"#,
            ),
            &settings(),
        )
        .unwrap();

        let decision = ev.evaluate(&input("GET", "/v1.43/_ping")).await.unwrap();
        assert!(decision.allows.contains_key("allow_ping"));
        assert!(decision.ok);

        let decision = ev.evaluate(&input("POST", "/v1.43/containers/create")).await.unwrap();
        assert!(decision.skips.contains_key("allow_ping"));
        assert!(!decision.ok, "skip alone must not approve");
    }

    #[tokio::test]
    async fn test_missing_message_fails_construction_with_name_in_detail() {
        let err = Evaluator::new(
            modules(r#"policy "broken" { default result="allow"; }"#),
            &settings(),
        )
        .unwrap_err();
        match err {
            PolicyError::MetaPolicyFailed { details } => {
                assert!(details.contains("broken"), "details: {details}");
            }
            other => panic!("expected MetaPolicyFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_runtime_invalid_result_denies_and_partitions() {
        // Statically fine (default is valid); the bogus result only fires on
        // matching input, landing the policy in invalid_policies.
        let ev = Evaluator::new(
            modules(
                r#"
policy "allow_all" { default result="allow" message="ok"; }
policy "sometimes_bogus" {
    default result="skip" message="n/a"
    rule result="maybe" message="?" {
        when "input.method == \"DELETE\""
    }
}
"#,
            ),
            &settings(),
        )
        .unwrap();

        let decision = ev.evaluate(&input("DELETE", "/x")).await.unwrap();
        assert!(decision.invalid_policies.contains("sometimes_bogus"));
        assert!(!decision.ok);
        assert_eq!(
            decision.all_policies.len(),
            decision.denies.len()
                + decision.allows.len()
                + decision.skips.len()
                + decision.invalid_policies.len()
        );
    }

    #[tokio::test]
    async fn test_remember_flows_to_store_and_back() {
        let ev = Arc::new(
            Evaluator::new(
                modules(
                    r#"
policy "counter" {
    default result="allow" message="ok"
    remember key="last_uri" value="input.uri"
}
"#,
                ),
                &settings(),
            )
            .unwrap(),
        );

        let decision = ev.evaluate(&input("GET", "/v1/info")).await.unwrap();
        assert_eq!(decision.to_store["counter"], json!({"last_uri": "/v1/info"}));

        // Not active in the loader cell, so the write is discarded.
        ev.write_back(&decision.to_store).unwrap();
        assert_eq!(ev.stored("counter"), json!({}));
    }

    #[tokio::test]
    async fn test_to_store_non_object_marks_invalid_storage() {
        let ev = Evaluator::new(
            modules(
                r#"
policy "bad_storage" {
    default result="allow" message="ok"
    to-store "input.uri"
}
"#,
            ),
            &settings(),
        )
        .unwrap();
        let decision = ev.evaluate(&input("GET", "/x")).await.unwrap();
        assert!(decision.invalid_storage.contains("bad_storage"));
        assert!(!decision.ok);
        assert!(decision.to_store.is_empty());
    }

    #[tokio::test]
    async fn test_policies_read_their_own_storage() {
        let ev = Evaluator::new(
            modules(
                r#"
policy "sticky" {
    default result="allow" message="first time"
    rule result="deny" message="already seen" {
        when "storage.seen == true"
    }
    remember key="seen" value="true"
}
"#,
            ),
            &settings(),
        )
        .unwrap();

        let decision = ev.evaluate(&input("GET", "/x")).await.unwrap();
        assert!(decision.ok);

        // Simulate an active-evaluator write, then re-evaluate.
        let mut tx = ev.store.begin_write();
        tx.write("sticky", json!({"seen": true})).unwrap();
        tx.commit();

        let decision = ev.evaluate(&input("GET", "/x")).await.unwrap();
        assert!(!decision.ok);
        assert_eq!(
            decision.denies.get("sticky").map(String::as_str),
            Some("already seen")
        );
    }

    #[tokio::test]
    async fn test_duplicate_policy_names_rejected() {
        let err = Evaluator::new(
            modules(
                r#"
policy "same" { default result="allow" message="a"; }
policy "same" { default result="deny" message="b"; }
"#,
            ),
            &settings(),
        )
        .unwrap_err();
        assert!(matches!(err, PolicyError::DuplicatePolicy(_)));
    }
}
