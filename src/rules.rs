//! Sandboxed heuristic rule evaluation.
//!
//! The rule catalog is data: an ordered list of Lua chunks, each returning
//! a table with an `evaluate(message, config)` function that yields
//! `{ triggered, contribution, evidence }`. The four built-in rules live in
//! `rules/*.lua` and are compiled into the binary; a configured
//! `sandbox.rules_dir` appends further `*.lua` files in name order.
//!
//! Every rule runs in its own VM from [`crate::lua_runtime`], under a
//! wall-clock deadline shared by all rules of one message and a per-VM heap
//! ceiling. Resource faults and script errors never escape: they are
//! recorded on the [`RuleResult`] and the score keeps whatever the rules
//! that finished contributed.
//!
//! # Rule contract
//!
//! ```lua
//! local rule = { name = "my_rule" }
//! function rule.evaluate(message, config)
//!     -- message: fingerprint, message_id, sender, subject, sent_at, body, attachments
//!     -- config:  sender_allowlist
//!     return { triggered = false, contribution = 0, evidence = {} }
//! end
//! return rule
//! ```

use anyhow::{Context, Result};
use globset::Glob;
use mlua::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::SandboxConfig;
use crate::lua_runtime::{
    is_memory_error, json_value_to_lua, lua_value_to_json, new_sandboxed_vm, VmLimits,
};
use crate::models::Message;

/// Upper bound of the composite rule score.
pub const MAX_RULE_SCORE: f64 = 100.0;

/// One rule script in the catalog.
#[derive(Debug, Clone)]
pub struct RuleScript {
    pub name: String,
    pub source: String,
}

impl RuleScript {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }
}

/// The built-in rule catalog, in evaluation order.
pub fn builtin_rules() -> Vec<RuleScript> {
    vec![
        RuleScript::new(
            "deadline_keyword",
            include_str!("../rules/deadline_keyword.lua"),
        ),
        RuleScript::new(
            "priority_keyword",
            include_str!("../rules/priority_keyword.lua"),
        ),
        RuleScript::new(
            "sender_allowlist",
            include_str!("../rules/sender_allowlist.lua"),
        ),
        RuleScript::new("action_verbs", include_str!("../rules/action_verbs.lua")),
    ]
}

/// Built-ins followed by every `*.lua` file in `rules_dir`, sorted by name.
pub fn load_rule_catalog(config: &SandboxConfig) -> Result<Vec<RuleScript>> {
    let mut rules = builtin_rules();
    if let Some(dir) = &config.rules_dir {
        rules.extend(load_rules_dir(dir)?);
    }
    Ok(rules)
}

fn load_rules_dir(dir: &Path) -> Result<Vec<RuleScript>> {
    let matcher = Glob::new("*.lua")?.compile_matcher();
    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read rules directory: {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| matcher.is_match(n))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();

    paths
        .into_iter()
        .map(|path| {
            let source = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read rule script: {}", path.display()))?;
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| path.display().to_string());
            Ok(RuleScript { name, source })
        })
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════
// Results
// ═══════════════════════════════════════════════════════════════════════

/// What a single rule reported.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleOutcome {
    pub triggered: bool,
    pub contribution: f64,
    pub evidence: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Structured evidence: the flags of the built-in rules plus the raw
/// outcome of every rule that ran.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleEvidence {
    pub has_deadline_keyword: bool,
    pub has_priority_keyword: bool,
    pub is_whitelisted_sender: bool,
    pub action_verb_count: u32,
    pub rules: BTreeMap<String, RuleOutcome>,
}

impl RuleEvidence {
    fn absorb(&mut self, name: &str, outcome: RuleOutcome) {
        if let Some(obj) = outcome.evidence.as_object() {
            if let Some(b) = obj.get("hasDeadlineKeyword").and_then(|v| v.as_bool()) {
                self.has_deadline_keyword |= b;
            }
            if let Some(b) = obj.get("hasPriorityKeyword").and_then(|v| v.as_bool()) {
                self.has_priority_keyword |= b;
            }
            if let Some(b) = obj.get("isWhitelistedSender").and_then(|v| v.as_bool()) {
                self.is_whitelisted_sender |= b;
            }
            if let Some(n) = obj.get("actionVerbCount").and_then(|v| v.as_u64()) {
                self.action_verb_count = self.action_verb_count.saturating_add(n as u32);
            }
        }
        self.rules.insert(name.to_string(), outcome);
    }
}

/// Per-message rule evaluation result. Immutable once produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleResult {
    /// Composite score in `[0, 100]`.
    pub score: f64,
    pub trigger_count: u32,
    pub evidence: RuleEvidence,
    pub elapsed_ms: u64,
    pub timed_out: bool,
    pub exceeded_memory: bool,
}

impl RuleResult {
    /// Score mapped to `[0, 1]`.
    pub fn normalized(&self) -> f64 {
        (self.score / MAX_RULE_SCORE).clamp(0.0, 1.0)
    }

    pub fn faulted(&self) -> bool {
        self.timed_out || self.exceeded_memory
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Evaluator
// ═══════════════════════════════════════════════════════════════════════

/// Executes the rule catalog against messages.
///
/// Cheap to clone; clones share the catalog. Holds no mutable state, so
/// concurrent use from several pipelines cannot cross-talk.
#[derive(Debug, Clone)]
pub struct RuleEvaluator {
    rules: Arc<Vec<RuleScript>>,
    timeout: Duration,
    memory_limit_bytes: usize,
    sender_allowlist: Arc<Vec<String>>,
}

impl RuleEvaluator {
    pub fn new(rules: Vec<RuleScript>, config: &SandboxConfig) -> Self {
        Self {
            rules: Arc::new(rules),
            timeout: Duration::from_millis(config.timeout_ms),
            memory_limit_bytes: config.memory_limit_mb.saturating_mul(1024 * 1024),
            sender_allowlist: Arc::new(config.sender_allowlist.clone()),
        }
    }

    /// Evaluator over the built-in catalog plus `rules_dir`.
    pub fn from_config(config: &SandboxConfig) -> Result<Self> {
        Ok(Self::new(load_rule_catalog(config)?, config))
    }

    /// Same catalog, new limits and allow-list.
    pub fn reconfigured(&self, config: &SandboxConfig) -> Self {
        Self {
            rules: self.rules.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            memory_limit_bytes: config.memory_limit_mb.saturating_mul(1024 * 1024),
            sender_allowlist: Arc::new(config.sender_allowlist.clone()),
        }
    }

    /// Wall-clock budget for evaluating `messages` messages in sequence.
    pub fn batch_budget(&self, messages: usize) -> Duration {
        self.timeout.saturating_mul(messages.min(u32::MAX as usize) as u32)
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name.as_str()).collect()
    }

    /// Evaluate one message on a blocking thread.
    ///
    /// Only fails if the evaluation thread itself panics.
    pub async fn execute(&self, message: &Message) -> Result<RuleResult> {
        let evaluator = self.clone();
        let message = message.clone();
        tokio::task::spawn_blocking(move || evaluator.evaluate(&message))
            .await
            .context("Rule evaluation task panicked")
    }

    /// Evaluate messages one after another, preserving input order.
    pub async fn execute_batch(&self, messages: &[Message]) -> Result<Vec<RuleResult>> {
        let evaluator = self.clone();
        let messages = messages.to_vec();
        tokio::task::spawn_blocking(move || {
            messages
                .iter()
                .map(|m| evaluator.evaluate(m))
                .collect::<Vec<_>>()
        })
        .await
        .context("Rule evaluation task panicked")
    }

    /// Evaluate one message synchronously.
    pub fn evaluate(&self, message: &Message) -> RuleResult {
        let started = Instant::now();
        let mut result = RuleResult::default();

        if message.body.trim().is_empty() {
            debug!(fp_prefix = message.fp_prefix(), "empty body, rule score 0");
            result.elapsed_ms = started.elapsed().as_millis() as u64;
            return result;
        }

        let message_json = match serde_json::to_value(message) {
            Ok(v) => v,
            Err(e) => {
                warn!(fp_prefix = message.fp_prefix(), error = %e, "message not representable, rule score 0");
                result.elapsed_ms = started.elapsed().as_millis() as u64;
                return result;
            }
        };
        let config_json = serde_json::json!({ "sender_allowlist": *self.sender_allowlist });

        let limits = VmLimits {
            deadline: started + self.timeout,
            memory_limit_bytes: self.memory_limit_bytes,
        };

        let mut total = 0.0;
        for rule in self.rules.iter() {
            if Instant::now() > limits.deadline {
                result.timed_out = true;
                break;
            }

            let timed_out = Arc::new(AtomicBool::new(false));
            match run_rule(rule, &limits, timed_out.clone(), &message_json, &config_json) {
                Ok(outcome) => {
                    if outcome.triggered {
                        result.trigger_count += 1;
                    }
                    total += outcome.contribution;
                    result.evidence.absorb(&rule.name, outcome);
                }
                Err(e) if timed_out.load(Ordering::SeqCst) => {
                    warn!(fp_prefix = message.fp_prefix(), rule = %rule.name, error = %e, "rule evaluation timed out");
                    result.timed_out = true;
                    break;
                }
                Err(e) if is_memory_error(&e) => {
                    warn!(fp_prefix = message.fp_prefix(), rule = %rule.name, "rule evaluation exceeded memory ceiling");
                    result.exceeded_memory = true;
                    break;
                }
                Err(e) => {
                    warn!(fp_prefix = message.fp_prefix(), rule = %rule.name, error = %e, "rule script failed, contributes 0");
                    result.evidence.absorb(
                        &rule.name,
                        RuleOutcome {
                            triggered: false,
                            contribution: 0.0,
                            evidence: serde_json::Value::Object(Default::default()),
                            error: Some(e.to_string()),
                        },
                    );
                }
            }
        }

        result.score = total.clamp(0.0, MAX_RULE_SCORE);
        result.elapsed_ms = started.elapsed().as_millis() as u64;
        debug!(
            fp_prefix = message.fp_prefix(),
            score = result.score,
            triggers = result.trigger_count,
            elapsed_ms = result.elapsed_ms,
            "rules evaluated"
        );
        result
    }
}

/// Run one rule in a fresh VM and decode its outcome.
fn run_rule(
    rule: &RuleScript,
    limits: &VmLimits,
    timed_out: Arc<AtomicBool>,
    message: &serde_json::Value,
    config: &serde_json::Value,
) -> LuaResult<RuleOutcome> {
    let lua = new_sandboxed_vm(limits, &rule.name, timed_out)?;

    let module: LuaTable = lua.load(&rule.source).set_name(&rule.name).eval()?;
    let evaluate: LuaFunction = module.get("evaluate")?;

    let message_value = json_value_to_lua(&lua, message)?;
    let config_value = json_value_to_lua(&lua, config)?;
    let ret: LuaValue = evaluate.call((message_value, config_value))?;

    let table = match ret {
        LuaValue::Table(t) => t,
        other => {
            return Err(LuaError::RuntimeError(format!(
                "evaluate() must return a table, got {}",
                other.type_name()
            )))
        }
    };

    let triggered = table.get::<Option<bool>>("triggered")?.unwrap_or(false);
    let contribution = table
        .get::<Option<f64>>("contribution")?
        .filter(|c| c.is_finite())
        .unwrap_or(0.0);
    let evidence = match table.get::<LuaValue>("evidence")? {
        LuaValue::Nil => serde_json::Value::Object(Default::default()),
        v => lua_value_to_json(v)?,
    };

    Ok(RuleOutcome {
        triggered,
        contribution,
        evidence,
        error: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageRecord;

    fn config() -> SandboxConfig {
        SandboxConfig {
            sender_allowlist: vec!["boss@example.com".into(), "@partner.org".into()],
            ..SandboxConfig::default()
        }
    }

    fn message(sender: &str, subject: &str, body: &str) -> Message {
        Message::from_record(
            MessageRecord {
                message_id: Some(format!("{}@example.com", subject.len())),
                sender: Some(sender.into()),
                subject: Some(subject.into()),
                sent_at: None,
                body: body.into(),
                attachments: vec![],
            },
            100_000,
        )
    }

    fn evaluator() -> RuleEvaluator {
        RuleEvaluator::new(builtin_rules(), &config())
    }

    #[test]
    fn test_deadline_and_priority_detected() {
        let result = evaluator().evaluate(&message(
            "someone@else.com",
            "Report",
            "Please submit the report by Friday, this is urgent",
        ));
        assert!(result.evidence.has_deadline_keyword);
        assert!(result.evidence.has_priority_keyword);
        assert!(!result.evidence.is_whitelisted_sender);
        assert_eq!(result.evidence.action_verb_count, 1);
        assert!(result.score > 0.0);
        assert_eq!(result.score, 70.0);
        assert_eq!(result.trigger_count, 3);
        assert!(!result.timed_out && !result.exceeded_memory);
    }

    #[test]
    fn test_neutral_message_scores_zero() {
        let result = evaluator().evaluate(&message(
            "stranger@nowhere.net",
            "Hello",
            "The weather was lovely on our walk.",
        ));
        assert_eq!(result.score, 0.0);
        assert_eq!(result.trigger_count, 0);
        assert_eq!(result.evidence.rules.len(), 4);
    }

    #[test]
    fn test_allowlist_exact_and_domain() {
        let e = evaluator();
        let exact = e.evaluate(&message("Boss <BOSS@example.com>", "Hi", "Lunch?"));
        assert!(exact.evidence.is_whitelisted_sender);
        assert_eq!(exact.score, 20.0);

        let domain = e.evaluate(&message("ann@partner.org", "Hi", "Lunch?"));
        assert!(domain.evidence.is_whitelisted_sender);

        let other = e.evaluate(&message("ann@notpartner.com", "Hi", "Lunch?"));
        assert!(!other.evidence.is_whitelisted_sender);
    }

    #[test]
    fn test_action_verbs_capped() {
        let result = evaluator().evaluate(&message(
            "x@y.com",
            "Todo",
            "Review the draft, sign the form, pay the invoice and schedule a call.",
        ));
        assert!(result.evidence.action_verb_count >= 4);
        let verbs = &result.evidence.rules["action_verbs"];
        assert_eq!(verbs.contribution, 20.0);
    }

    #[test]
    fn test_empty_body_scores_zero_without_running_rules() {
        let result = evaluator().evaluate(&message("boss@example.com", "urgent", "   "));
        assert_eq!(result.score, 0.0);
        assert!(result.evidence.rules.is_empty());
    }

    #[test]
    fn test_isolation_between_messages() {
        let leaky = RuleScript::new(
            "leaky",
            r#"
            local rule = { name = "leaky" }
            function rule.evaluate(message, config)
                counter = (counter or 0) + 1
                string.lower = function(s) return "urgent" end
                return { triggered = counter > 1, contribution = counter * 5, evidence = {} }
            end
            return rule
            "#,
        );
        let mut rules = vec![leaky];
        rules.extend(builtin_rules());
        let e = RuleEvaluator::new(rules, &config());

        let a = message("a@b.com", "A", "Please review this by Monday");
        let b = message("c@d.com", "B", "Nice photos from the trip.");

        let b_alone = e.evaluate(&b);
        let _ = e.evaluate(&a);
        let b_after_a = e.evaluate(&b);

        assert_eq!(b_alone.score, b_after_a.score);
        assert_eq!(b_alone.evidence, b_after_a.evidence);
        assert_eq!(b_alone.score, 5.0);
        assert!(!b_after_a.evidence.has_priority_keyword);
    }

    #[test]
    fn test_script_error_contributes_zero() {
        let broken = RuleScript::new(
            "broken",
            r#"return { evaluate = function(m, c) error("boom") end }"#,
        );
        let mut rules = builtin_rules();
        rules.push(broken);
        let e = RuleEvaluator::new(rules, &config());
        let result = e.evaluate(&message("x@y.com", "S", "urgent"));
        assert_eq!(result.score, 30.0);
        assert!(result.evidence.rules["broken"].error.is_some());
        assert!(!result.faulted());
    }

    #[test]
    fn test_sandbox_blocks_host_access() {
        let snoop = RuleScript::new(
            "snoop",
            r#"
            local rule = {}
            function rule.evaluate(m, c)
                local ok = pcall(function() return io.open("/etc/passwd") end)
                return { triggered = ok, contribution = ok and 100 or 0,
                         evidence = { os = type(os), load = type(load) } }
            end
            return rule
            "#,
        );
        let e = RuleEvaluator::new(vec![snoop], &config());
        let result = e.evaluate(&message("x@y.com", "S", "body"));
        assert_eq!(result.score, 0.0);
        let ev = &result.evidence.rules["snoop"].evidence;
        assert_eq!(ev["os"], "nil");
        assert_eq!(ev["load"], "nil");
    }

    #[test]
    fn test_runaway_rule_times_out() {
        let spin = RuleScript::new(
            "spin",
            r#"return { evaluate = function(m, c) while true do end end }"#,
        );
        let mut rules = builtin_rules();
        rules.insert(0, spin);
        let e = RuleEvaluator::new(
            rules,
            &SandboxConfig {
                timeout_ms: 50,
                ..config()
            },
        );
        let started = Instant::now();
        let result = e.evaluate(&message("x@y.com", "S", "urgent by friday"));
        assert!(result.timed_out);
        assert_eq!(result.score, 0.0);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_rule_swallowing_its_abort_still_times_out() {
        let stubborn = RuleScript::new(
            "stubborn",
            r#"return { evaluate = function(m, c)
                while true do pcall(function() while true do end end) end
            end }"#,
        );
        let e = RuleEvaluator::new(
            vec![stubborn],
            &SandboxConfig {
                timeout_ms: 50,
                ..config()
            },
        );
        let m = message("x@y.com", "S", "urgent");

        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(e.evaluate(&m));
        });
        let result = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("evaluation did not return within 5s of a 50ms budget");
        assert!(result.timed_out);
        assert!(!result.exceeded_memory);
        assert_eq!(result.score, 0.0);
    }

    #[test]
    fn test_memory_error_message_is_a_script_error() {
        let liar = RuleScript::new(
            "liar",
            r#"return { evaluate = function(m, c) error("not enough memory") end }"#,
        );
        let mut rules = builtin_rules();
        rules.push(liar);
        let e = RuleEvaluator::new(rules, &config());
        let result = e.evaluate(&message("x@y.com", "S", "urgent"));
        assert!(!result.exceeded_memory);
        assert!(!result.faulted());
        assert!(result.evidence.rules["liar"].error.is_some());
        assert_eq!(result.score, 30.0);
    }

    #[test]
    fn test_batch_budget_scales_with_messages() {
        let e = RuleEvaluator::new(
            builtin_rules(),
            &SandboxConfig {
                timeout_ms: 250,
                ..config()
            },
        );
        assert_eq!(e.batch_budget(0), Duration::ZERO);
        assert_eq!(e.batch_budget(4), Duration::from_secs(1));
    }

    #[test]
    fn test_one_millisecond_budget_never_hangs() {
        let e = RuleEvaluator::new(
            builtin_rules(),
            &SandboxConfig {
                timeout_ms: 1,
                ..config()
            },
        );
        let started = Instant::now();
        let result = e.evaluate(&message("x@y.com", "S", "Please submit by Friday"));
        assert!(started.elapsed() < Duration::from_secs(2));
        if !result.timed_out {
            assert_eq!(result.evidence.rules.len(), 4);
        }
    }

    #[test]
    fn test_memory_hog_flagged() {
        let hog = RuleScript::new(
            "hog",
            r#"return { evaluate = function(m, c)
                local t = {}
                for i = 1, 100000000 do t[i] = string.rep("x", 128) .. i end
            end }"#,
        );
        let mut rules = builtin_rules();
        rules.push(hog);
        let e = RuleEvaluator::new(
            rules,
            &SandboxConfig {
                memory_limit_mb: 2,
                timeout_ms: 10_000,
                ..config()
            },
        );
        let result = e.evaluate(&message("x@y.com", "S", "urgent"));
        assert!(result.exceeded_memory);
        assert!(!result.timed_out);
        // Built-ins ran before the hog and keep their partial score.
        assert_eq!(result.score, 30.0);
    }

    #[tokio::test]
    async fn test_execute_batch_preserves_order() {
        let e = evaluator();
        let messages = vec![
            message("x@y.com", "A", "urgent"),
            message("x@y.com", "B", "nothing here"),
            message("boss@example.com", "C", "hello"),
        ];
        let results = e.execute_batch(&messages).await.unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].score, 30.0);
        assert_eq!(results[1].score, 0.0);
        assert_eq!(results[2].score, 20.0);

        let single = e.execute(&messages[0]).await.unwrap();
        assert_eq!(single.score, results[0].score);
    }

    #[test]
    fn test_rules_dir_appended_in_name_order() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("b_rule.lua"),
            "return { evaluate = function() return {} end }",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("a_rule.lua"),
            "return { evaluate = function() return {} end }",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let e = RuleEvaluator::from_config(&SandboxConfig {
            rules_dir: Some(dir.path().to_path_buf()),
            ..config()
        })
        .unwrap();
        let names = e.rule_names();
        assert_eq!(names.len(), 6);
        assert_eq!(&names[4..], &["a_rule", "b_rule"]);
    }
}
