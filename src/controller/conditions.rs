//! Condition management helpers following Kubernetes API conventions
//!
//! Entries are never removed. A transition marks the new condition `True`
//! and flips any other `True` condition to `False`, so the list reads as an
//! audit trail while `status.state` stays authoritative.

use chrono::Utc;

use crate::crd::Condition;

/// Standard condition statuses
pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";

/// Update or add a condition to the conditions list
///
/// `last_update_time` is refreshed on every write, `last_transition_time`
/// only when the status flips.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
) {
    let now = Utc::now().to_rfc3339();

    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status != status {
            existing.last_transition_time = now.clone();
        }
        existing.status = status.to_string();
        existing.reason = reason.to_string();
        existing.message = message.to_string();
        existing.last_update_time = now;
    } else {
        conditions.push(Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: now.clone(),
            last_update_time: now,
        });
    }
}

/// Make `type_` the single `True` condition
///
/// Every other condition that is currently `True` is flipped to `False`
/// with reason `Superseded`. Nothing is deleted.
pub fn supersede(conditions: &mut Vec<Condition>, type_: &str, reason: &str, message: &str) {
    let superseded: Vec<String> = conditions
        .iter()
        .filter(|c| c.type_ != type_ && c.is_true())
        .map(|c| c.type_.clone())
        .collect();

    for other in superseded {
        set_condition(
            conditions,
            &other,
            CONDITION_STATUS_FALSE,
            "Superseded",
            &format!("Superseded by {type_}"),
        );
    }

    set_condition(conditions, type_, CONDITION_STATUS_TRUE, reason, message);
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Check if a condition is true
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_)
        .map(Condition::is_true)
        .unwrap_or(false)
}
