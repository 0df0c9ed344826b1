//! Custom assertion helpers for envelope transitions.

use serde_json::Value;

/// Assert that every top-level field of `before` is present and unchanged in
/// `after`, except `completedStages`.
pub fn assert_carries_forward(before: &Value, after: &Value) {
    let before = before.as_object().expect("before is not an object");
    let after = after.as_object().expect("after is not an object");

    for (key, value) in before {
        if key == "completedStages" {
            continue;
        }
        assert_eq!(
            after.get(key),
            Some(value),
            "field '{key}' was not carried forward unchanged"
        );
    }
}

/// Assert that `after` has exactly the keys of `before` plus `added`.
pub fn assert_adds_only(before: &Value, after: &Value, added: &str) {
    let before = before.as_object().expect("before is not an object");
    let after = after.as_object().expect("after is not an object");

    assert!(!before.contains_key(added), "'{added}' was already present");
    assert!(after.contains_key(added), "'{added}' was not added");
    assert_eq!(after.len(), before.len() + 1, "unexpected extra fields: {after:?}");
}

/// Assert the mask after a transition is the mask before OR `bit`.
pub fn assert_mask_transition(before: &Value, after: &Value, bit: u64) {
    let before_mask = before["completedStages"].as_u64().unwrap_or(0);
    let after_mask = after["completedStages"]
        .as_u64()
        .expect("completedStages missing after transition");

    assert_eq!(after_mask, before_mask | bit);
    assert_eq!(after_mask & before_mask, before_mask, "a completion bit was cleared");
}
