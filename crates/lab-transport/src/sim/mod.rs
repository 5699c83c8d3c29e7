//! Deterministic instrument simulation.
//!
//! [`SimEngine`] interprets a profile's simulation rules against a mutable
//! key/value state: rules are matched first-to-last (full match,
//! case-insensitive), the winner may respond, update state, or both. A small
//! set of built-ins (`*IDN?`, `*CLS`, `:SYSTem:ERRor?`) answers when no rule
//! matches, and an emulated error queue is fed by the profile's error rules.
//!
//! [`SimTransport`] wraps an engine behind the [`Transport`] contract. State
//! mutation is atomic per call; concurrent callers serialize on the engine
//! lock.

pub mod expr;

use crate::{is_error_query, Transport, TransportResult};
use async_trait::async_trait;
use lab_core::{TransportError, TransportErrorKind};
use lab_profiles::{EvalOrder, ProfileSpec, SimAction, SimValue};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use regex::Regex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub use expr::SharedRng;

struct CompiledRule {
    pattern: Regex,
    response: Option<String>,
    action: Option<SimAction>,
    target: Option<String>,
    value: Option<String>,
}

struct CompiledErrorRule {
    pattern: Regex,
    condition: String,
    code: i32,
    message: String,
}

/// Compile a dispatch pattern, anchored so rules full-match the command.
fn compile(pattern: &str) -> Result<Regex, TransportError> {
    regex::RegexBuilder::new(&format!(r"\A(?:{})\z", pattern))
        .case_insensitive(true)
        .build()
        .map_err(|e| {
            TransportError::protocol(format!("pattern '{}' failed to compile: {}", pattern, e))
        })
}

/// Replace `$1`..`$9` with the corresponding capture group.
fn substitute(template: &str, groups: &[String]) -> String {
    let mut out = template.to_string();
    for (i, group) in groups.iter().enumerate() {
        out = out.replace(&format!("${}", i + 1), group);
    }
    out
}

/// Rule-driven simulator for one instrument.
pub struct SimEngine {
    identity: String,
    rules: Vec<CompiledRule>,
    error_rules: Vec<CompiledErrorRule>,
    state: BTreeMap<String, SimValue>,
    error_queue: VecDeque<(i32, String)>,
    eval_order: EvalOrder,
    strict: bool,
    rng: SharedRng,
}

impl SimEngine {
    /// Build an engine from a validated profile. `seed` makes `uniform()`
    /// reproducible; `None` seeds from the OS.
    pub fn new(
        profile: &ProfileSpec,
        strict: bool,
        seed: Option<u64>,
    ) -> Result<Self, TransportError> {
        let mut rules = Vec::with_capacity(profile.simulation.scpi.len());
        for rule in &profile.simulation.scpi {
            rules.push(CompiledRule {
                pattern: compile(&rule.command)?,
                response: rule.response.clone(),
                action: rule.action,
                target: rule.target.clone(),
                value: rule.value.clone(),
            });
        }
        let mut error_rules = Vec::with_capacity(profile.simulation.errors.len());
        for rule in &profile.simulation.errors {
            error_rules.push(CompiledErrorRule {
                pattern: compile(&rule.scpi)?,
                condition: rule.condition.clone(),
                code: rule.code,
                message: rule.message.clone(),
            });
        }
        let rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Ok(Self {
            identity: profile.sim_identity(),
            rules,
            error_rules,
            state: profile.simulation.state.clone(),
            error_queue: VecDeque::new(),
            eval_order: profile.simulation.response_eval_order,
            strict,
            rng: Arc::new(Mutex::new(rng)),
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Current value of a state key (test and CLI introspection).
    pub fn state_value(&self, key: &str) -> Option<&SimValue> {
        self.state.get(key)
    }

    /// Execute one command. `expect_response` distinguishes queries from
    /// writes when no rule matches.
    pub fn execute(
        &mut self,
        command: &str,
        expect_response: bool,
    ) -> Result<String, TransportError> {
        let command = command.trim();

        for i in 0..self.rules.len() {
            let Some(captures) = self.rules[i].pattern.captures(command) else {
                continue;
            };
            let groups: Vec<String> = (1..captures.len())
                .map(|g| {
                    captures
                        .get(g)
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_default()
                })
                .collect();
            let response = self.run_rule(i, command, &groups)?;
            self.run_error_rules(command, &groups)?;
            return Ok(response);
        }

        // built-ins answer only when no rule claimed the command
        if is_error_query(command) {
            return Ok(self.pop_error());
        }
        let upper = command.to_ascii_uppercase();
        if upper == "*CLS" {
            self.error_queue.clear();
            return Ok(String::new());
        }
        if upper == "*IDN?" {
            return Ok(self.identity.clone());
        }

        if self.strict && expect_response {
            return Err(TransportError::new(
                TransportErrorKind::Protocol,
                format!("no simulation rule matches query '{}'", command),
            ));
        }
        tracing::debug!(command, "unmatched simulation command ignored");
        Ok(String::new())
    }

    fn run_rule(
        &mut self,
        index: usize,
        command: &str,
        groups: &[String],
    ) -> Result<String, TransportError> {
        let rule = &self.rules[index];
        let is_set = matches!(rule.action, Some(SimAction::Set));
        let response_template = rule.response.clone();
        let target = rule.target.clone();
        let value_expr = rule.value.clone();

        let pre_state = self.state.clone();

        if is_set {
            let (Some(target), Some(value_expr)) = (target, value_expr) else {
                return Err(TransportError::protocol(format!(
                    "rule for '{}' is missing target/value",
                    command
                )));
            };
            let target = substitute(&target, groups);
            let value = expr::eval_expr(&value_expr, &pre_state, groups, &self.rng)?;
            tracing::debug!(%target, value = %value, "simulation state update");
            self.state.insert(target, value);
        }

        let Some(template) = response_template else {
            return Ok(String::new());
        };

        if let Some(expression) = template.strip_prefix("expr:") {
            let visible = match self.eval_order {
                EvalOrder::Pre => &pre_state,
                EvalOrder::Post => &self.state,
            };
            let value = expr::eval_expr(expression, visible, groups, &self.rng)?;
            Ok(value.to_string())
        } else {
            Ok(substitute(&template, groups))
        }
    }

    fn run_error_rules(&mut self, command: &str, groups: &[String]) -> Result<(), TransportError> {
        for i in 0..self.error_rules.len() {
            let rule = &self.error_rules[i];
            let Some(captures) = rule.pattern.captures(command) else {
                continue;
            };
            // error rules see their own captures, not the dispatch rule's
            let own_groups: Vec<String> = (1..captures.len())
                .map(|g| {
                    captures
                        .get(g)
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_default()
                })
                .collect();
            let groups = if own_groups.is_empty() {
                groups.to_vec()
            } else {
                own_groups
            };
            let condition = rule.condition.clone();
            let code = rule.code;
            let message = rule.message.clone();
            let verdict = expr::eval_expr(&condition, &self.state, &groups, &self.rng)?;
            let triggered = match verdict {
                SimValue::Bool(b) => b,
                SimValue::Int(i) => i != 0,
                SimValue::Float(f) => f != 0.0,
                SimValue::Text(_) => false,
            };
            if triggered {
                tracing::debug!(code, message = %message, "simulated instrument error queued");
                self.error_queue.push_back((code, message));
            }
        }
        Ok(())
    }

    fn pop_error(&mut self) -> String {
        match self.error_queue.pop_front() {
            Some((code, message)) => format!("{},\"{}\"", code, message),
            None => "+0,\"No error\"".to_string(),
        }
    }
}

/// [`Transport`] implementation backed by a [`SimEngine`].
pub struct SimTransport {
    engine: Mutex<SimEngine>,
    timeout: Mutex<Duration>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl SimTransport {
    pub fn new(engine: SimEngine) -> Self {
        Self {
            engine: Mutex::new(engine),
            timeout: Mutex::new(Duration::from_secs(5)),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Convenience constructor from a profile.
    pub fn from_profile(
        profile: &ProfileSpec,
        strict: bool,
        seed: Option<u64>,
    ) -> Result<Self, TransportError> {
        Ok(Self::new(SimEngine::new(profile, strict, seed)?))
    }

    fn check_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::closed("simulator session is closed"));
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::closed("simulator session is not connected"));
        }
        Ok(())
    }

    /// Peek at a simulator state key (test hook).
    pub fn state_value(&self, key: &str) -> Option<SimValue> {
        self.engine.lock().state_value(key).cloned()
    }
}

#[async_trait]
impl Transport for SimTransport {
    async fn connect(&self) -> TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::closed("simulator session is closed").into());
        }
        self.connected.store(true, Ordering::SeqCst);
        tracing::debug!(identity = %self.engine.lock().identity(), "simulator connected");
        Ok(())
    }

    async fn write(&self, command: &str) -> TransportResult<()> {
        self.check_open()?;
        self.engine.lock().execute(command, false)?;
        Ok(())
    }

    async fn query(&self, command: &str) -> TransportResult<String> {
        self.check_open()?;
        let response = self.engine.lock().execute(command, true)?;
        Ok(response)
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn set_timeout(&self, timeout: Duration) -> TransportResult<()> {
        *self.timeout.lock() = timeout;
        Ok(())
    }

    async fn timeout(&self) -> Duration {
        *self.timeout.lock()
    }

    fn identity_hint(&self) -> Option<String> {
        Some(self.engine.lock().identity().to_string())
    }
}
