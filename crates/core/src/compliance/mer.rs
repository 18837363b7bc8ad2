use std::collections::BTreeSet;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::cpt::{has_add_on_marker, normalize_code};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MerRole {
    Primary,
    Secondary,
    AddOn,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerLine {
    pub code: String,
    pub allowed_amount: Decimal,
    #[serde(default)]
    pub add_on: bool,
}

impl MerLine {
    pub fn base(code: &str, allowed_amount: Decimal) -> Self {
        Self { code: code.to_string(), allowed_amount, add_on: false }
    }

    pub fn add_on(code: &str, allowed_amount: Decimal) -> Self {
        Self { code: code.to_string(), allowed_amount, add_on: true }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerAdjustment {
    pub code: String,
    pub role: MerRole,
    pub allowed_amount: Decimal,
    pub payment_amount: Decimal,
    pub reduction: Decimal,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerSummary {
    pub adjustments: Vec<MerAdjustment>,
    pub total_allowed: Decimal,
    pub total_payment: Decimal,
}

impl MerSummary {
    pub fn primary(&self) -> Option<&MerAdjustment> {
        self.adjustments.iter().find(|adjustment| adjustment.role == MerRole::Primary)
    }

    pub fn for_code(&self, code: &str) -> Option<&MerAdjustment> {
        let code = normalize_code(code);
        self.adjustments.iter().find(|adjustment| normalize_code(&adjustment.code) == code)
    }
}

/// Multiple Endoscopy Rule: the highest-valued base code is paid in full,
/// other base codes at half, add-on codes in full.
#[derive(Clone, Debug, Default)]
pub struct MerCalculator {
    add_on_codes: BTreeSet<String>,
}

impl MerCalculator {
    pub fn new(add_on_codes: BTreeSet<String>) -> Self {
        Self { add_on_codes }
    }

    pub fn is_add_on(&self, line: &MerLine) -> bool {
        line.add_on
            || has_add_on_marker(&line.code)
            || self.add_on_codes.contains(&normalize_code(&line.code))
    }

    pub fn calculate(&self, lines: &[MerLine]) -> MerSummary {
        if lines.is_empty() {
            return MerSummary::default();
        }

        // Strict comparison keeps the earliest line on ties.
        let mut primary_index: Option<usize> = None;
        for (index, line) in lines.iter().enumerate() {
            if self.is_add_on(line) {
                continue;
            }
            let beats_current = primary_index
                .map(|current| line.allowed_amount > lines[current].allowed_amount)
                .unwrap_or(true);
            if beats_current {
                primary_index = Some(index);
            }
        }

        let adjustments: Vec<MerAdjustment> = lines
            .iter()
            .enumerate()
            .map(|(index, line)| {
                let role = if self.is_add_on(line) {
                    MerRole::AddOn
                } else if Some(index) == primary_index {
                    MerRole::Primary
                } else {
                    MerRole::Secondary
                };
                let payment_amount = match role {
                    MerRole::Secondary => line.allowed_amount / Decimal::TWO,
                    MerRole::Primary | MerRole::AddOn => line.allowed_amount,
                };
                MerAdjustment {
                    code: line.code.clone(),
                    role,
                    allowed_amount: line.allowed_amount,
                    payment_amount,
                    reduction: line.allowed_amount - payment_amount,
                }
            })
            .collect();

        let total_allowed = adjustments.iter().map(|adjustment| adjustment.allowed_amount).sum();
        let total_payment = adjustments.iter().map(|adjustment| adjustment.payment_amount).sum();
        MerSummary { adjustments, total_allowed, total_payment }
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::{MerCalculator, MerLine, MerRole};

    #[test]
    fn highest_base_is_primary_others_half_add_ons_full() {
        let summary = MerCalculator::default().calculate(&[
            MerLine::base("31652", Decimal::new(400, 0)),
            MerLine::base("31628", Decimal::new(250, 0)),
            MerLine::add_on("+31654", Decimal::new(150, 0)),
        ]);

        let ebus = summary.for_code("31652").expect("31652 adjustment");
        assert_eq!(ebus.role, MerRole::Primary);
        assert_eq!(ebus.payment_amount, Decimal::new(400, 0));

        let tblb = summary.for_code("31628").expect("31628 adjustment");
        assert_eq!(tblb.role, MerRole::Secondary);
        assert_eq!(tblb.payment_amount, Decimal::new(125, 0));
        assert_eq!(tblb.reduction, Decimal::new(125, 0));

        let radial = summary.for_code("+31654").expect("31654 adjustment");
        assert_eq!(radial.role, MerRole::AddOn);
        assert_eq!(radial.payment_amount, Decimal::new(150, 0));
        assert_eq!(radial.reduction, Decimal::ZERO);

        assert_eq!(summary.total_allowed, Decimal::new(800, 0));
        assert_eq!(summary.total_payment, Decimal::new(675, 0));
    }

    #[test]
    fn empty_input_yields_empty_summary() {
        let summary = MerCalculator::default().calculate(&[]);
        assert!(summary.adjustments.is_empty());
        assert_eq!(summary.total_allowed, Decimal::ZERO);
        assert!(summary.primary().is_none());
    }

    #[test]
    fn ties_are_broken_by_input_order() {
        let summary = MerCalculator::default().calculate(&[
            MerLine::base("31625", Decimal::new(200, 0)),
            MerLine::base("31623", Decimal::new(200, 0)),
        ]);
        assert_eq!(summary.primary().map(|adjustment| adjustment.code.as_str()), Some("31625"));

        let reversed = MerCalculator::default().calculate(&[
            MerLine::base("31623", Decimal::new(200, 0)),
            MerLine::base("31625", Decimal::new(200, 0)),
        ]);
        assert_eq!(reversed.primary().map(|adjustment| adjustment.code.as_str()), Some("31623"));
    }

    #[test]
    fn configured_add_on_list_is_honored_without_marker() {
        let calculator = MerCalculator::new(["31627".to_string()].into_iter().collect());
        let summary = calculator.calculate(&[
            MerLine::base("31627", Decimal::new(95, 0)),
            MerLine::base("31628", Decimal::new(250, 0)),
        ]);

        let role = |code: &str| summary.for_code(code).map(|adjustment| adjustment.role);
        assert_eq!(role("31627"), Some(MerRole::AddOn));
        assert_eq!(role("31628"), Some(MerRole::Primary));
    }
}
