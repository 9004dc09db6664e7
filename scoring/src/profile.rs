//! Compiled ensemble profiles.
//!
//! A profile pairs an ordered member list with a parallel weight list. The
//! two are zipped once at load so every [`EnsembleMember`] carries its own
//! weight and nothing downstream can index one list with the other's length.

use std::collections::HashSet;

use serde::Serialize;
use serde_json::Value;

use crate::adapter::OutputMode;
use crate::error::{ConfigError, ConfigResult};
use crate::function::spec::{EnsembleDef, MemberDef};

/// One independently configured backend contributing a vote.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnsembleMember {
    pub id: String,
    pub model: String,
    pub mode: OutputMode,
    /// Backend name; `None` resolves to the default backend.
    pub backend: Option<String>,
    pub weight: f64,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub options: Value,
}

impl EnsembleMember {
    pub fn new(id: impl Into<String>, model: impl Into<String>, mode: OutputMode) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            mode,
            backend: None,
            weight: 1.0,
            options: Value::Null,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }
}

/// Ordered, validated member list for one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnsembleProfile {
    members: Vec<EnsembleMember>,
}

impl EnsembleProfile {
    /// Validate member ids and weights. `task` is only used for error messages.
    pub fn new(task: usize, members: Vec<EnsembleMember>) -> ConfigResult<Self> {
        if members.is_empty() {
            return Err(ConfigError::EmptyEnsemble { task });
        }
        let mut seen = HashSet::new();
        for member in &members {
            if !seen.insert(member.id.as_str()) {
                return Err(ConfigError::DuplicateMember {
                    task,
                    member: member.id.clone(),
                });
            }
            if !member.weight.is_finite() || member.weight < 0.0 {
                return Err(ConfigError::InvalidWeight {
                    task,
                    member: member.id.clone(),
                    weight: member.weight,
                });
            }
        }
        Ok(Self { members })
    }

    /// Zip a serialized member list with its parallel weight list.
    pub fn from_def(task: usize, def: &EnsembleDef) -> ConfigResult<Self> {
        if def.members.len() != def.weights.len() {
            return Err(ConfigError::WeightCountMismatch {
                task,
                members: def.members.len(),
                weights: def.weights.len(),
            });
        }
        let members = def
            .members
            .iter()
            .zip(&def.weights)
            .map(|(member, &weight)| compile_member(member, weight))
            .collect();
        Self::new(task, members)
    }

    pub fn members(&self) -> &[EnsembleMember] {
        &self.members
    }

    pub fn total_weight(&self) -> f64 {
        self.members.iter().map(|m| m.weight).sum()
    }
}

fn compile_member(def: &MemberDef, weight: f64) -> EnsembleMember {
    EnsembleMember {
        id: def.id.clone().unwrap_or_else(|| def.model.clone()),
        model: def.model.clone(),
        mode: def.mode,
        backend: def.backend.clone(),
        weight,
        options: def.options.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member_def(model: &str) -> MemberDef {
        MemberDef {
            id: None,
            model: model.to_string(),
            mode: OutputMode::SingleChoice,
            backend: None,
            options: Value::Null,
        }
    }

    #[test]
    fn zips_weights_and_defaults_ids_to_model() {
        let def = EnsembleDef {
            members: vec![member_def("a/one"), member_def("b/two")],
            weights: vec![1.0, 0.5],
        };
        let profile = EnsembleProfile::from_def(0, &def).unwrap();
        assert_eq!(profile.members()[0].id, "a/one");
        assert_eq!(profile.members()[1].weight, 0.5);
        assert!((profile.total_weight() - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn weight_count_mismatch_rejected() {
        let def = EnsembleDef {
            members: vec![member_def("a"), member_def("b")],
            weights: vec![1.0],
        };
        assert!(matches!(
            EnsembleProfile::from_def(2, &def),
            Err(ConfigError::WeightCountMismatch {
                task: 2,
                members: 2,
                weights: 1
            })
        ));
    }

    #[test]
    fn negative_and_nan_weights_rejected() {
        for weight in [-1.0, f64::NAN, f64::INFINITY] {
            let members =
                vec![EnsembleMember::new("m", "x", OutputMode::SingleChoice).with_weight(weight)];
            assert!(matches!(
                EnsembleProfile::new(0, members),
                Err(ConfigError::InvalidWeight { .. })
            ));
        }
    }

    #[test]
    fn zero_weight_is_allowed() {
        let members = vec![
            EnsembleMember::new("a", "x", OutputMode::SingleChoice),
            EnsembleMember::new("b", "y", OutputMode::SingleChoice).with_weight(0.0),
        ];
        assert!(EnsembleProfile::new(0, members).is_ok());
    }

    #[test]
    fn duplicate_ids_and_empty_ensembles_rejected() {
        let members = vec![
            EnsembleMember::new("a", "x", OutputMode::SingleChoice),
            EnsembleMember::new("a", "y", OutputMode::SingleChoice),
        ];
        assert!(matches!(
            EnsembleProfile::new(0, members),
            Err(ConfigError::DuplicateMember { .. })
        ));
        assert!(matches!(
            EnsembleProfile::new(1, Vec::new()),
            Err(ConfigError::EmptyEnsemble { task: 1 })
        ));
    }
}
