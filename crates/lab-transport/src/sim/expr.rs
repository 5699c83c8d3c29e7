//! Sandboxed expression evaluation for simulation rules.
//!
//! Rule expressions run in a bounded `evalexpr` context: simulator state keys
//! and regex capture groups are variables, plus a short function whitelist
//! (`state(key)` for dynamic lookups, `float`/`int` for parsing captured
//! strings, `uniform(lo, hi)` for declared noise). Nothing else resolves -
//! there is no escape hatch into arbitrary code.

use evalexpr::{ContextWithMutableFunctions, ContextWithMutableVariables, Function, Value};
use lab_core::TransportError;
use lab_profiles::SimValue;
use parking_lot::Mutex;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Shared, seedable RNG backing `uniform()`.
pub type SharedRng = Arc<Mutex<ChaCha8Rng>>;

fn to_eval(value: &SimValue) -> Value {
    match value {
        SimValue::Bool(b) => Value::Boolean(*b),
        SimValue::Int(i) => Value::Int(*i),
        SimValue::Float(f) => Value::Float(*f),
        SimValue::Text(s) => Value::String(s.clone()),
    }
}

fn from_eval(value: Value) -> Result<SimValue, TransportError> {
    match value {
        Value::Boolean(b) => Ok(SimValue::Bool(b)),
        Value::Int(i) => Ok(SimValue::Int(i)),
        Value::Float(f) => Ok(SimValue::Float(f)),
        Value::String(s) => Ok(SimValue::Text(s)),
        Value::Empty => Ok(SimValue::Text(String::new())),
        other => Err(TransportError::protocol(format!(
            "simulation expression produced unsupported value {:?}",
            other
        ))),
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Evaluate `expr` against a state snapshot and the capture groups of the
/// matched command.
pub fn eval_expr(
    expr: &str,
    state: &BTreeMap<String, SimValue>,
    groups: &[String],
    rng: &SharedRng,
) -> Result<SimValue, TransportError> {
    let mut context = evalexpr::HashMapContext::new();

    for (key, value) in state {
        // keys that are not plain identifiers remain reachable via state()
        if is_identifier(key) {
            context
                .set_value(key.clone(), to_eval(value))
                .map_err(expr_error(expr))?;
        }
    }
    for (i, group) in groups.iter().enumerate() {
        context
            .set_value(format!("g{}", i + 1), Value::String(group.clone()))
            .map_err(expr_error(expr))?;
    }

    let snapshot = state.clone();
    context
        .set_function(
            "state".into(),
            Function::new(move |arg| {
                let key = arg.as_string()?;
                Ok(snapshot
                    .get(&key)
                    .map(to_eval)
                    .unwrap_or(Value::Empty))
            }),
        )
        .map_err(expr_error(expr))?;

    context
        .set_function(
            "float".into(),
            Function::new(|arg| {
                if let Ok(f) = arg.as_number() {
                    return Ok(Value::Float(f));
                }
                let text = arg.as_string()?;
                text.trim()
                    .parse::<f64>()
                    .map(Value::Float)
                    .map_err(|e| {
                        evalexpr::EvalexprError::CustomMessage(format!(
                            "float('{}'): {}",
                            text, e
                        ))
                    })
            }),
        )
        .map_err(expr_error(expr))?;

    context
        .set_function(
            "int".into(),
            Function::new(|arg| {
                if let Ok(i) = arg.as_int() {
                    return Ok(Value::Int(i));
                }
                let text = arg.as_string()?;
                text.trim()
                    .parse::<i64>()
                    .map(Value::Int)
                    .map_err(|e| {
                        evalexpr::EvalexprError::CustomMessage(format!(
                            "int('{}'): {}",
                            text, e
                        ))
                    })
            }),
        )
        .map_err(expr_error(expr))?;

    let uniform_rng = Arc::clone(rng);
    context
        .set_function(
            "uniform".into(),
            Function::new(move |arg| {
                let tuple = arg.as_tuple()?;
                if tuple.len() != 2 {
                    return Err(evalexpr::EvalexprError::CustomMessage(
                        "uniform() takes exactly (lo, hi)".to_string(),
                    ));
                }
                let lo = tuple[0].as_number()?;
                let hi = tuple[1].as_number()?;
                if !(lo <= hi) {
                    return Err(evalexpr::EvalexprError::CustomMessage(format!(
                        "uniform({}, {}): empty range",
                        lo, hi
                    )));
                }
                let sample = uniform_rng.lock().gen_range(lo..=hi);
                Ok(Value::Float(sample))
            }),
        )
        .map_err(expr_error(expr))?;

    let value = evalexpr::eval_with_context(expr, &context).map_err(expr_error(expr))?;
    from_eval(value)
}

fn expr_error(expr: &str) -> impl Fn(evalexpr::EvalexprError) -> TransportError + '_ {
    move |e| {
        TransportError::protocol(format!(
            "simulation expression '{}' failed: {}",
            expr, e
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn rng() -> SharedRng {
        Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(7)))
    }

    fn state(pairs: &[(&str, SimValue)]) -> BTreeMap<String, SimValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn state_keys_are_variables() {
        let st = state(&[("voltage", SimValue::Float(5.0))]);
        let out = eval_expr("voltage * 2", &st, &[], &rng()).unwrap();
        assert_eq!(out, SimValue::Float(10.0));
    }

    #[test]
    fn groups_and_dynamic_state_lookup() {
        let st = state(&[("volt1", SimValue::Float(3.3))]);
        let groups = vec!["1".to_string()];
        let out = eval_expr("state(\"volt\" + g1)", &st, &groups, &rng()).unwrap();
        assert_eq!(out, SimValue::Float(3.3));
    }

    #[test]
    fn float_parses_captured_strings() {
        let groups = vec!["1".to_string(), "7.25".to_string()];
        let out = eval_expr("float(g2)", &BTreeMap::new(), &groups, &rng()).unwrap();
        assert_eq!(out, SimValue::Float(7.25));
    }

    #[test]
    fn uniform_is_reproducible_for_a_fixed_seed() {
        let a = eval_expr("uniform(0.0, 1.0)", &BTreeMap::new(), &[], &rng()).unwrap();
        let b = eval_expr("uniform(0.0, 1.0)", &BTreeMap::new(), &[], &rng()).unwrap();
        assert_eq!(a, b);
        if let SimValue::Float(v) = a {
            assert!((0.0..=1.0).contains(&v));
        } else {
            panic!("uniform should produce a float");
        }
    }

    #[test]
    fn unknown_functions_do_not_resolve() {
        let err = eval_expr("exec(\"rm -rf\")", &BTreeMap::new(), &[], &rng());
        assert!(err.is_err());
    }

    #[test]
    fn conditionals_work_on_state() {
        let st = state(&[
            ("out1", SimValue::Int(1)),
            ("volt1", SimValue::Float(2.5)),
        ]);
        let groups = vec!["1".to_string()];
        let out = eval_expr(
            "if(state(\"out\" + g1) > 0, state(\"volt\" + g1), 0.0)",
            &st,
            &groups,
            &rng(),
        )
        .unwrap();
        assert_eq!(out, SimValue::Float(2.5));
    }
}
