//! The fixed 11-stage task lifecycle.

use serde::{Deserialize, Serialize};

/// One of the 11 stages every task executes, in the order of [`Stage::SEQUENCE`].
///
/// `critique` and `refine` only run when `validateQuality` raises the
/// `refinementNeeded` flag; the runner then loops back to `promptTemplating`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    Ingestion,
    PreProcessing,
    PromptTemplating,
    Inference,
    Parsing,
    ValidateStructure,
    ValidateQuality,
    Critique,
    Refine,
    FinalValidation,
    Integration,
}

impl Stage {
    /// Canonical execution order.
    pub const SEQUENCE: [Stage; 11] = [
        Stage::Ingestion,
        Stage::PreProcessing,
        Stage::PromptTemplating,
        Stage::Inference,
        Stage::Parsing,
        Stage::ValidateStructure,
        Stage::ValidateQuality,
        Stage::Critique,
        Stage::Refine,
        Stage::FinalValidation,
        Stage::Integration,
    ];

    /// Wire name of the stage (camelCase, matches the snapshot schema).
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Ingestion => "ingestion",
            Stage::PreProcessing => "preProcessing",
            Stage::PromptTemplating => "promptTemplating",
            Stage::Inference => "inference",
            Stage::Parsing => "parsing",
            Stage::ValidateStructure => "validateStructure",
            Stage::ValidateQuality => "validateQuality",
            Stage::Critique => "critique",
            Stage::Refine => "refine",
            Stage::FinalValidation => "finalValidation",
            Stage::Integration => "integration",
        }
    }

    /// Position of the stage within [`Stage::SEQUENCE`].
    pub fn index(&self) -> usize {
        Self::SEQUENCE
            .iter()
            .position(|s| s == self)
            .unwrap_or_default()
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_is_the_canonical_order() {
        let names: Vec<&str> = Stage::SEQUENCE.iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            vec![
                "ingestion",
                "preProcessing",
                "promptTemplating",
                "inference",
                "parsing",
                "validateStructure",
                "validateQuality",
                "critique",
                "refine",
                "finalValidation",
                "integration",
            ]
        );
    }

    #[test]
    fn serde_names_match_wire_names() {
        for stage in Stage::SEQUENCE {
            let json = serde_json::to_string(&stage).unwrap();
            assert_eq!(json, format!("\"{}\"", stage.name()));
            let back: Stage = serde_json::from_str(&json).unwrap();
            assert_eq!(back, stage);
        }
    }

    #[test]
    fn index_round_trips() {
        for (i, stage) in Stage::SEQUENCE.iter().enumerate() {
            assert_eq!(stage.index(), i);
        }
    }
}
