// 🏷️ Status Vocabulary - Persisted status / label strings
//
// These strings are read by reporting and export code downstream and must
// match byte for byte.

use serde::{Deserialize, Serialize};

pub const STATUS_RECONCILED: &str = "01_Conciliado";
pub const STATUS_FOUND_WITH_DIFFERENCE: &str = "02_Encontrado c/Diferença";
pub const STATUS_NOT_FOUND: &str = "03_Não Encontrado";
pub const STATUS_NOT_EVALUATED: &str = "04_Não Avaliado";

pub const LABEL_RECONCILED: &str = "Conciliado";
pub const LABEL_IMMATERIAL_DIFFERENCE: &str = "Diferença Imaterial";
pub const LABEL_BASE_A_GREATER: &str = "Encontrado com diferença, BASE A MAIOR";
pub const LABEL_BASE_B_GREATER: &str = "Encontrado com diferença, BASE B MAIOR";
pub const LABEL_NOT_FOUND: &str = "Não encontrado";

/// Mark group for reversal pairs
pub const GROUP_REVERSAL_PAIR: &str = "Conciliado_Estorno";

/// Mark group for reversal candidates left without a partner
pub const GROUP_REVERSED_DOCUMENTS: &str = "Documentos estornados";

/// Fixed tolerance for "exact" float comparisons
pub const EPSILON: f64 = 1e-6;

/// Round to 6 decimal places
pub fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

// ============================================================================
// MATCH STATUS
// ============================================================================

/// Outcome of one match group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchStatus {
    Reconciled,
    ImmaterialDifference,
    BaseAGreater,
    BaseBGreater,
    NotFound,
}

impl MatchStatus {
    /// Classify a group. First matching rule wins.
    pub fn classify(has_a: bool, has_b: bool, difference: f64, materiality_tolerance: f64) -> Self {
        if !(has_a && has_b) {
            return MatchStatus::NotFound;
        }

        let abs = difference.abs();
        if abs <= EPSILON {
            MatchStatus::Reconciled
        } else if materiality_tolerance > 0.0 && abs <= materiality_tolerance.max(EPSILON) {
            MatchStatus::ImmaterialDifference
        } else if difference > 0.0 {
            MatchStatus::BaseAGreater
        } else {
            MatchStatus::BaseBGreater
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            MatchStatus::Reconciled => STATUS_RECONCILED,
            MatchStatus::ImmaterialDifference
            | MatchStatus::BaseAGreater
            | MatchStatus::BaseBGreater => STATUS_FOUND_WITH_DIFFERENCE,
            MatchStatus::NotFound => STATUS_NOT_FOUND,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            MatchStatus::Reconciled => LABEL_RECONCILED,
            MatchStatus::ImmaterialDifference => LABEL_IMMATERIAL_DIFFERENCE,
            MatchStatus::BaseAGreater => LABEL_BASE_A_GREATER,
            MatchStatus::BaseBGreater => LABEL_BASE_B_GREATER,
            MatchStatus::NotFound => LABEL_NOT_FOUND,
        }
    }
}
