use proptest::prelude::*;
use serde_json::{Map, Value};

use end_model::{Config, merge};

// ============================================================
// Arbitrary Generators
// ============================================================

fn arb_leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i32>().prop_map(Value::from),
        "[a-z]{0,6}".prop_map(Value::from),
    ]
}

fn arb_tree() -> impl Strategy<Value = Value> {
    arb_leaf().prop_recursive(3, 48, 4, |inner| {
        prop::collection::btree_map("[a-e]", inner, 0..4)
            .prop_map(|m| Value::Object(m.into_iter().collect::<Map<String, Value>>()))
    })
}

fn arb_object() -> impl Strategy<Value = Value> {
    prop::collection::btree_map("[a-e]", arb_tree(), 0..5)
        .prop_map(|m| Value::Object(m.into_iter().collect::<Map<String, Value>>()))
}

/// Every override leaf wins, every untouched base key survives.
fn check_precedence(base: &Value, overrides: &Value, merged: &Value) -> Result<(), TestCaseError> {
    match (base, overrides) {
        (Value::Object(b), Value::Object(o)) => {
            let Value::Object(m) = merged else {
                return Err(TestCaseError::fail("merged mapping is not a mapping"));
            };
            for (key, value) in o {
                let got = &m[key];
                match b.get(key) {
                    Some(existing) => check_precedence(existing, value, got)?,
                    None => prop_assert_eq!(got, value),
                }
            }
            for (key, value) in b {
                if !o.contains_key(key) {
                    prop_assert_eq!(&m[key], value);
                }
            }
            let expected_len = b.len() + o.keys().filter(|k| !b.contains_key(*k)).count();
            prop_assert_eq!(m.len(), expected_len);
        }
        (_, replacement) => prop_assert_eq!(merged, replacement),
    }
    Ok(())
}

proptest! {
    #[test]
    fn prop_empty_override_is_identity(base in arb_object()) {
        prop_assert_eq!(merge(&base, &Value::Object(Map::new())), base.clone());
    }

    #[test]
    fn prop_merge_is_idempotent(base in arb_object(), overrides in arb_object()) {
        let once = merge(&base, &overrides);
        let twice = merge(&once, &overrides);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn prop_overrides_win_and_siblings_survive(base in arb_object(), overrides in arb_object()) {
        let merged = merge(&base, &overrides);
        check_precedence(&base, &overrides, &merged)?;
    }

    #[test]
    fn prop_defaults_never_lose_keys(overrides in arb_object()) {
        let defaults = Config::defaults();
        let merged = defaults.merged(&overrides);
        let Value::Object(base) = defaults.as_value() else {
            return Err(TestCaseError::fail("defaults are not a mapping"));
        };
        for key in base.keys() {
            prop_assert!(merged.as_value().get(key).is_some(), "lost default key {}", key);
        }
    }
}

#[test]
fn nested_override_merges_instead_of_replacing() {
    let merged = Config::defaults().merged(&serde_json::json!({
        "train_config": {"optimizer_config": {"lr": 0.5}}
    }));
    assert_eq!(
        merged.get("train_config.optimizer_config.lr"),
        Some(&serde_json::json!(0.5))
    );
    assert_eq!(
        merged.get("train_config.optimizer_config.optimizer"),
        Some(&serde_json::json!("adam"))
    );
    assert_eq!(merged.get("train_config.n_epochs"), Some(&serde_json::json!(10)));
}
