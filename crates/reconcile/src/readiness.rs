use serde_json::Value;
use tether_core::{Condition, Error, ReadinessPolicy, Result, SubjectStatus, TYPE_READY};
use tracing::debug;

/// Set the `Ready` condition of `status` from `observed` according to `policy`.
///
/// Errors leave `Ready` untouched except for a malformed `status` under
/// `DeriveFromObject`, which also marks the subject unavailable.
pub fn apply_readiness(status: &mut SubjectStatus, policy: &ReadinessPolicy, observed: &Value) -> Result<()> {
    match policy {
        ReadinessPolicy::SuccessfulCreate => {
            status.set_condition(Condition::available());
            Ok(())
        }
        ReadinessPolicy::DeriveFromObject => derive_from_object(status, observed),
        ReadinessPolicy::UseExpression(expr) => {
            let ready = tether_cel::eval_document(expr, observed)
                .map_err(|e| Error::Expression(format!("readiness expression {:?}: {}", expr, e)))?;
            if ready {
                status.set_condition(Condition::available());
            } else {
                debug!(expression = %expr, "readiness expression is false");
                status.set_condition(
                    Condition::unavailable().with_message(format!("Readiness expression {:?} evaluated to false", expr)),
                );
            }
            Ok(())
        }
    }
}

fn derive_from_object(status: &mut SubjectStatus, observed: &Value) -> Result<()> {
    let ready = match ready_condition_status(observed) {
        Ok(s) => s,
        Err(e) => {
            status.set_condition(
                Condition::unavailable().with_message("Got error while getting conditions from observed object"),
            );
            return Err(e);
        }
    };
    if ready != "True" {
        debug!(status = %ready, "observed object is not ready");
        status.set_condition(Condition::unavailable().with_message(format!(
            "Observed object's condition with type {:?} is {:?} but should be {:?}",
            TYPE_READY, ready, "True"
        )));
        return Ok(());
    }
    let observed_generation = observed.pointer("/status/observedGeneration").and_then(Value::as_i64);
    if let Some(og) = observed_generation {
        let generation = observed.pointer("/metadata/generation").and_then(Value::as_i64).unwrap_or(0);
        if og != generation {
            debug!(observed_generation = og, generation, "observed object status is stale");
            status.set_condition(Condition::unavailable().with_message(
                "Observed object's status.observedGeneration is not equal to metadata.generation",
            ));
            return Ok(());
        }
    }
    status.set_condition(Condition::available());
    Ok(())
}

/// Status string of the observed `Ready` condition, `Unknown` when there is none.
fn ready_condition_status(observed: &Value) -> Result<String> {
    let malformed = |what: &str| Error::Policy(format!("failed to get conditions from observed object: {}", what));
    let conditions = match observed.get("status") {
        None | Some(Value::Null) => return Ok("Unknown".into()),
        Some(Value::Object(st)) => match st.get("conditions") {
            None | Some(Value::Null) => return Ok("Unknown".into()),
            Some(Value::Array(items)) => items,
            Some(_) => return Err(malformed("status.conditions is not a list")),
        },
        Some(_) => return Err(malformed("status is not an object")),
    };
    for c in conditions {
        let obj = c.as_object().ok_or_else(|| malformed("condition is not an object"))?;
        if obj.get("type").and_then(Value::as_str) == Some(TYPE_READY) {
            return match obj.get("status") {
                Some(Value::String(s)) => Ok(s.clone()),
                None | Some(Value::Null) => Ok("Unknown".into()),
                Some(_) => Err(malformed("condition status is not a string")),
            };
        }
    }
    Ok("Unknown".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tether_core::ConditionStatus;

    fn ready_of(status: &SubjectStatus) -> (ConditionStatus, Option<String>) {
        let c = status.condition(TYPE_READY).unwrap();
        (c.status, c.message.clone())
    }

    fn observed(ready: &str, generation: i64, observed_generation: i64) -> Value {
        json!({
            "metadata": { "name": "w1", "generation": generation },
            "status": {
                "observedGeneration": observed_generation,
                "conditions": [{ "type": "Synced", "status": "True" }, { "type": "Ready", "status": ready }]
            }
        })
    }

    #[test]
    fn successful_create_is_ready() {
        let mut st = SubjectStatus::default();
        apply_readiness(&mut st, &ReadinessPolicy::SuccessfulCreate, &json!({})).unwrap();
        assert_eq!(ready_of(&st).0, ConditionStatus::True);
    }

    #[test]
    fn derive_follows_ready_condition_and_generation() {
        let mut st = SubjectStatus::default();
        apply_readiness(&mut st, &ReadinessPolicy::DeriveFromObject, &observed("True", 2, 2)).unwrap();
        assert_eq!(ready_of(&st).0, ConditionStatus::True);

        apply_readiness(&mut st, &ReadinessPolicy::DeriveFromObject, &observed("False", 2, 2)).unwrap();
        let (s, msg) = ready_of(&st);
        assert_eq!(s, ConditionStatus::False);
        assert_eq!(msg.as_deref(), Some(r#"Observed object's condition with type "Ready" is "False" but should be "True""#));

        apply_readiness(&mut st, &ReadinessPolicy::DeriveFromObject, &observed("True", 3, 2)).unwrap();
        let (s, msg) = ready_of(&st);
        assert_eq!(s, ConditionStatus::False);
        assert!(msg.unwrap().contains("observedGeneration"));
    }

    #[test]
    fn derive_without_conditions_is_unknown_and_malformed_is_an_error() {
        let mut st = SubjectStatus::default();
        apply_readiness(&mut st, &ReadinessPolicy::DeriveFromObject, &json!({ "status": {} })).unwrap();
        assert!(ready_of(&st).1.unwrap().contains(r#"is "Unknown""#));

        let mut st = SubjectStatus::default();
        let bad = json!({ "status": { "conditions": "Ready" } });
        assert!(matches!(apply_readiness(&mut st, &ReadinessPolicy::DeriveFromObject, &bad), Err(Error::Policy(_))));
        assert_eq!(ready_of(&st).0, ConditionStatus::False);
    }

    #[test]
    fn expression_policy() {
        let policy = ReadinessPolicy::UseExpression("status.replicas == spec.replicas".into());
        let mut st = SubjectStatus::default();
        apply_readiness(&mut st, &policy, &json!({ "spec": { "replicas": 3 }, "status": { "replicas": 3 } })).unwrap();
        assert_eq!(ready_of(&st).0, ConditionStatus::True);

        apply_readiness(&mut st, &policy, &json!({ "spec": { "replicas": 3 }, "status": { "replicas": 1 } })).unwrap();
        assert_eq!(ready_of(&st).0, ConditionStatus::False);

        let broken = ReadinessPolicy::UseExpression("status.replicas ==".into());
        let err = apply_readiness(&mut st, &broken, &json!({ "status": {} })).unwrap_err();
        assert!(matches!(err, Error::Expression(_)), "{err}");
    }
}
