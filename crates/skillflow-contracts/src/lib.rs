#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde_json::Value;
use skillflow_domain::{ContractValidation, SkillCollaboration, StateContract};

/// Checks handoff payloads against the fields skills declare they exchange.
#[derive(Debug, Clone, Default)]
pub struct ContractValidator {
    collaborations: BTreeMap<String, SkillCollaboration>,
}

impl ContractValidator {
    /// Later descriptors for the same skill replace earlier ones.
    #[must_use]
    pub fn new(collaborations: &[SkillCollaboration]) -> Self {
        let collaborations = collaborations
            .iter()
            .map(|collab| (collab.skill.clone(), collab.clone()))
            .collect();
        Self { collaborations }
    }

    #[must_use]
    pub fn has_descriptor(&self, skill: &str) -> bool {
        self.collaborations.contains_key(skill)
    }

    /// The contract for a producer/consumer pair, if either side declares one.
    ///
    /// Required fields come from the receiver's `receives_from` entry for the
    /// producer; handoff fields from the producer's `hands_to` entry.
    #[must_use]
    pub fn contract_for(&self, from: &str, to: &str) -> Option<StateContract> {
        let required_fields = self
            .collaborations
            .get(to)
            .and_then(|collab| collab.receives_from.iter().find(|edge| edge.skill == from))
            .map(|edge| edge.fields.clone());
        let handoff_fields = self
            .collaborations
            .get(from)
            .and_then(|collab| collab.hands_to.iter().find(|edge| edge.skill == to))
            .map(|edge| edge.fields.clone());
        if required_fields.is_none() && handoff_fields.is_none() {
            return None;
        }
        Some(StateContract {
            from: from.to_string(),
            to: to.to_string(),
            required_fields: required_fields.unwrap_or_default(),
            handoff_fields: handoff_fields.unwrap_or_default(),
        })
    }

    /// Validate a handoff payload. Never fails; an undeclared pair is valid.
    #[must_use]
    pub fn validate(&self, from: &str, to: &str, payload: &Value) -> ContractValidation {
        let Some(contract) = self.contract_for(from, to) else {
            return ContractValidation {
                valid: true,
                ..ContractValidation::default()
            };
        };
        check_contract(&contract, payload)
    }
}

/// Evaluate a payload against a single contract.
#[must_use]
pub fn check_contract(contract: &StateContract, payload: &Value) -> ContractValidation {
    let fields = payload.as_object();
    let lookup = |field: &str| fields.and_then(|map| map.get(field));

    let mut missing_fields = Vec::new();
    let mut warnings = Vec::new();
    for field in &contract.required_fields {
        match lookup(field) {
            None => missing_fields.push(field.clone()),
            Some(value) if is_empty_value(value) => warnings.push(format!(
                "field {field} required by {} is present but empty",
                contract.to
            )),
            Some(_) => {}
        }
    }
    for field in &contract.handoff_fields {
        if contract.required_fields.contains(field) {
            continue;
        }
        if lookup(field).is_none() {
            warnings.push(format!(
                "{} declares handoff field {field} for {} but the payload omits it",
                contract.from, contract.to
            ));
        }
    }

    ContractValidation {
        valid: missing_fields.is_empty(),
        missing_fields,
        warnings,
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use skillflow_domain::{CollaborationEdge, SkillCollaboration};

    use super::ContractValidator;

    fn edge(skill: &str, fields: &[&str]) -> CollaborationEdge {
        CollaborationEdge {
            skill: skill.to_string(),
            fields: fields.iter().map(ToString::to_string).collect(),
        }
    }

    fn validator() -> ContractValidator {
        ContractValidator::new(&[
            SkillCollaboration {
                skill: "backend".to_string(),
                receives_from: vec![edge("product-discovery", &["spec", "priority"])],
                hands_to: vec![edge("frontend", &["api", "api_docs"])],
            },
            SkillCollaboration {
                skill: "frontend".to_string(),
                receives_from: vec![edge("backend", &["api"])],
                hands_to: Vec::new(),
            },
        ])
    }

    #[test]
    fn missing_required_field_invalidates() {
        let result = validator().validate("product-discovery", "backend", &json!({"spec": "v1"}));
        assert!(!result.valid);
        assert_eq!(result.missing_fields, vec!["priority".to_string()]);
    }

    #[test]
    fn empty_required_field_only_warns() {
        let result = validator().validate(
            "product-discovery",
            "backend",
            &json!({"spec": "", "priority": []}),
        );
        assert!(result.valid);
        assert_eq!(result.warnings.len(), 2);
    }

    #[test]
    fn undeclared_handoff_field_warns() {
        let result = validator().validate("backend", "frontend", &json!({"api": "/v1"}));
        assert!(result.valid);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("api_docs"));
    }

    #[test]
    fn undeclared_pair_is_unconstrained() {
        let result = validator().validate("seo", "analytics", &json!("not even an object"));
        assert!(result.valid);
        assert!(result.missing_fields.is_empty());
        assert!(result.warnings.is_empty());
        assert!(validator().contract_for("seo", "analytics").is_none());
    }

    #[test]
    fn non_object_payload_misses_every_required_field() {
        let result = validator().validate("backend", "frontend", &json!(null));
        assert!(!result.valid);
        assert_eq!(result.missing_fields, vec!["api".to_string()]);
    }
}
