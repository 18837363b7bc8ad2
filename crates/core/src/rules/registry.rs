//! Code derivation from a structured registry record instead of note text.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{CodeSet, RuleStep, RulesResult, TraceEntry};
use crate::compliance::addon::gate_add_ons;
use crate::compliance::exclusive::enforce_exclusive;
use crate::domain::cpt::{
    BRONCH_ASPIRATION_INITIAL, BRONCH_ASPIRATION_SUBSEQUENT, BRONCH_BAL, BRONCH_BRUSHING,
    BRONCH_DIAGNOSTIC, BRONCH_DILATION, BRONCH_ENDOBRONCHIAL_BIOPSY, BRONCH_FIDUCIAL,
    BRONCH_NAVIGATION, BRONCH_STENT_BRONCHIAL, BRONCH_STENT_REVISION, BRONCH_STENT_TRACHEAL,
    BRONCH_TBLB, BRONCH_TBLB_ADDITIONAL_LOBE, BRONCH_TBNA, BRONCH_TBNA_ADDITIONAL_LOBE,
    BRONCH_THERMOPLASTY_ONE_LOBE, BRONCH_THERMOPLASTY_TWO_PLUS_LOBES, BRONCH_TUMOR_DESTRUCTION,
    BRONCH_TUMOR_EXCISION, BRONCH_VALVE_ADDITIONAL, BRONCH_VALVE_INITIAL, BRONCH_VALVE_REMOVAL,
    BRONCH_VALVE_REMOVAL_ADDITIONAL, EBUS_RADIAL, EBUS_TBNA_ONE_TWO_STATIONS,
    EBUS_TBNA_THREE_PLUS_STATIONS, PLEURAL_DRAIN_BLIND, PLEURAL_DRAIN_IMAGING,
    PLEURAL_IPC_PLACEMENT, PLEURAL_IPC_REMOVAL, PLEURODESIS_INSTILLATION, THORACENTESIS_BLIND,
    THORACENTESIS_IMAGING, THORACOSCOPY_DIAGNOSTIC, THORACOSCOPY_PLEURAL_BIOPSY,
    THORACOSCOPY_PLEURODESIS,
};
use crate::domain::registry::{RegistryProcedure, RegistryRecord};
use crate::knowledge::KnowledgeBase;

/// Sub-procedures that map to exactly one code when performed.
const DIRECT_CODES: [(&str, &str); 11] = [
    ("diagnostic_bronchoscopy", BRONCH_DIAGNOSTIC),
    ("brushings", BRONCH_BRUSHING),
    ("bal", BRONCH_BAL),
    ("endobronchial_biopsy", BRONCH_ENDOBRONCHIAL_BIOPSY),
    ("fiducial_placement", BRONCH_FIDUCIAL),
    ("navigational_bronchoscopy", BRONCH_NAVIGATION),
    ("airway_dilation", BRONCH_DILATION),
    ("stent_revision", BRONCH_STENT_REVISION),
    ("tumor_excision", BRONCH_TUMOR_EXCISION),
    ("tumor_destruction", BRONCH_TUMOR_DESTRUCTION),
    ("radial_ebus", EBUS_RADIAL),
];

/// Procedures that absorb a same-site dilation.
const DILATION_ABSORBERS: [(&str, &str); 5] = [
    (BRONCH_STENT_TRACHEAL, "airway_stent"),
    (BRONCH_STENT_BRONCHIAL, "airway_stent"),
    (BRONCH_STENT_REVISION, "stent_revision"),
    (BRONCH_TUMOR_EXCISION, "tumor_excision"),
    (BRONCH_TUMOR_DESTRUCTION, "tumor_destruction"),
];

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryDerivation {
    pub codes: CodeSet,
    pub warnings: Vec<String>,
    pub trace: Vec<TraceEntry>,
}

impl From<RegistryDerivation> for RulesResult {
    fn from(value: RegistryDerivation) -> Self {
        Self { codes: value.codes, trace: value.trace, warnings: value.warnings, shadow_diff: None }
    }
}

pub fn derive_from_registry(
    record: &RegistryRecord,
    knowledge: &KnowledgeBase,
) -> RegistryDerivation {
    let mut result = RulesResult::default();
    result.apply(map_performed(record));

    let mut step = RuleStep::begin("REG-DOMAIN", &result.codes);
    for code in result.codes.iter() {
        if !knowledge.is_valid(code) {
            step.discard(code, "not in knowledge base");
        }
    }
    result.apply(step);

    result.apply(mutual_exclusions(&result.codes, knowledge));
    result.apply(bundling(record, &result.codes, knowledge));
    result.apply(add_on_suppression(&result.codes, knowledge));

    RegistryDerivation { codes: result.codes, warnings: result.warnings, trace: result.trace }
}

fn map_performed(record: &RegistryRecord) -> RuleStep {
    let mut step = RuleStep::begin("REG-MAP", &CodeSet::new());

    for (name, code) in DIRECT_CODES {
        if record.performed(name).is_some() {
            step.add(code, format!("{name} performed"));
        }
    }

    if let Some(biopsy) = record.performed("transbronchial_biopsy") {
        step.add(BRONCH_TBLB, "transbronchial_biopsy performed");
        lobe_add_on(&mut step, biopsy, BRONCH_TBLB_ADDITIONAL_LOBE);
    }
    if let Some(tbna) = record.performed("tbna_conventional") {
        step.add(BRONCH_TBNA, "tbna_conventional performed");
        lobe_add_on(&mut step, tbna, BRONCH_TBNA_ADDITIONAL_LOBE);
    }

    if let Some(stent) = record.performed("airway_stent") {
        let location = stent.text("location").unwrap_or_default();
        if location.contains("trache") {
            step.add(BRONCH_STENT_TRACHEAL, "airway_stent performed in the trachea");
        } else {
            step.add(BRONCH_STENT_BRONCHIAL, "airway_stent performed (bronchial placement)");
        }
    }

    if let Some(aspiration) = record.performed("therapeutic_aspiration") {
        if aspiration.flag("subsequent_episode") {
            step.add(BRONCH_ASPIRATION_SUBSEQUENT, "therapeutic_aspiration, subsequent episode");
        } else {
            step.add(BRONCH_ASPIRATION_INITIAL, "therapeutic_aspiration performed");
        }
    }

    if let Some(ebus) = record.performed("linear_ebus") {
        let stations = ebus.distinct("stations");
        let count =
            if stations.is_empty() { ebus.count("station_count") } else { Some(stations.len()) };
        match count {
            Some(count) if count >= 3 => {
                step.add(
                    EBUS_TBNA_THREE_PLUS_STATIONS,
                    format!("linear_ebus with {count} stations"),
                );
            }
            Some(count) if count > 0 => {
                step.add(
                    EBUS_TBNA_ONE_TWO_STATIONS,
                    format!("linear_ebus with {count} station(s)"),
                );
            }
            _ => step.warn("linear_ebus performed without sampled stations; EBUS code withheld"),
        }
    }

    if let Some(valves) = record.performed("blvr_valve_placement") {
        step.add(BRONCH_VALVE_INITIAL, "blvr_valve_placement performed");
        if valves.distinct("lobes").len() >= 2 {
            step.add(BRONCH_VALVE_ADDITIONAL, "valves placed in additional lobe");
        }
    }
    if let Some(removal) = record.performed("blvr_valve_removal") {
        step.add(BRONCH_VALVE_REMOVAL, "blvr_valve_removal performed");
        if removal.distinct("lobes").len() >= 2 {
            step.add(BRONCH_VALVE_REMOVAL_ADDITIONAL, "valves removed from additional lobe");
        }
    }

    if let Some(thermoplasty) = record.performed("bronchial_thermoplasty") {
        if thermoplasty.distinct("lobes").len() >= 2 {
            step.add(
                BRONCH_THERMOPLASTY_TWO_PLUS_LOBES,
                "bronchial_thermoplasty of two or more lobes",
            );
        } else {
            step.add(BRONCH_THERMOPLASTY_ONE_LOBE, "bronchial_thermoplasty of one lobe");
        }
    }

    if let Some(catheter) = record.performed("ipc") {
        if catheter.text("action").as_deref() == Some("removal") {
            step.add(PLEURAL_IPC_REMOVAL, "ipc removal performed");
        } else {
            step.add(PLEURAL_IPC_PLACEMENT, "ipc placement performed");
        }
    }
    for (name, blind, guided) in [
        ("thoracentesis", THORACENTESIS_BLIND, THORACENTESIS_IMAGING),
        ("chest_tube", PLEURAL_DRAIN_BLIND, PLEURAL_DRAIN_IMAGING),
    ] {
        if let Some(procedure) = record.performed(name) {
            if imaging_guided(procedure) {
                step.add(guided, format!("{name} performed with imaging guidance"));
            } else {
                step.add(blind, format!("{name} performed without imaging guidance"));
            }
        }
    }
    if record.performed("pleurodesis").is_some() {
        step.add(PLEURODESIS_INSTILLATION, "pleurodesis performed");
    }
    if let Some(thoracoscopy) = record.performed("medical_thoracoscopy") {
        if thoracoscopy.flag("talc_poudrage") || thoracoscopy.flag("pleurodesis") {
            step.add(THORACOSCOPY_PLEURODESIS, "medical_thoracoscopy with pleurodesis");
        } else if thoracoscopy.flag("biopsy") {
            step.add(THORACOSCOPY_PLEURAL_BIOPSY, "medical_thoracoscopy with pleural biopsy");
        } else {
            step.add(THORACOSCOPY_DIAGNOSTIC, "medical_thoracoscopy, diagnostic");
        }
    }

    step
}

fn lobe_add_on(step: &mut RuleStep, procedure: &RegistryProcedure, add_on: &str) {
    let lobes = procedure.distinct("lobes");
    if lobes.len() >= 2 {
        let listed: Vec<&str> = lobes.iter().map(String::as_str).collect();
        step.add(add_on, format!("sampled lobes: {}", listed.join(", ")));
    }
}

fn imaging_guided(procedure: &RegistryProcedure) -> bool {
    procedure.flag("imaging_guided")
        || value_is_truthy(procedure.details.get("ultrasound_guided"))
        || procedure.details.get("guidance").and_then(Value::as_str).is_some_and(|guidance| {
            let guidance = guidance.trim().to_ascii_lowercase();
            !guidance.is_empty() && guidance != "none"
        })
}

/// Registry flags arrive as booleans, numbers or yes/no strings.
fn value_is_truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(number)) => number.as_f64().is_some_and(|value| value != 0.0),
        Some(Value::String(text)) => {
            matches!(text.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "y")
        }
        _ => false,
    }
}

fn mutual_exclusions(codes: &CodeSet, knowledge: &KnowledgeBase) -> RuleStep {
    let mut step = RuleStep::begin("REG-EXCLUSIVE", codes);
    let (_, applied) = enforce_exclusive(codes, knowledge.exclusive_pairs());
    for pair in applied {
        step.discard(&pair.loser, format!("mutually exclusive with {}", pair.winner));
    }
    step
}

fn bundling(record: &RegistryRecord, codes: &CodeSet, knowledge: &KnowledgeBase) -> RuleStep {
    let mut step = RuleStep::begin("REG-BUNDLE", codes);

    if step.has(BRONCH_DILATION) {
        let dilation = record.performed("airway_dilation");
        let dilation_site = dilation.and_then(|dilation| dilation.text("location"));
        let absorbers: Vec<(&str, Option<String>)> = DILATION_ABSORBERS
            .iter()
            .filter(|(code, _)| step.has(code))
            .map(|(code, procedure)| {
                let location =
                    record.performed(procedure).and_then(|performed| performed.text("location"));
                (*code, location)
            })
            .collect();

        if let Some((primary, _)) = absorbers.first() {
            let distinct = dilation.is_some_and(|dilation| dilation.flag("distinct_site"))
                || match &dilation_site {
                    Some(site) => absorbers
                        .iter()
                        .all(|(_, other)| other.as_ref().is_some_and(|other| other != site)),
                    None => false,
                };
            if distinct {
                step.warn(format!(
                    "{BRONCH_DILATION} kept with {primary}: dilation at a distinct airway location"
                ));
            } else {
                let reason = format!(
                    "{BRONCH_DILATION} bundled into {primary}: \
                     dilation at the same site is included in the primary procedure"
                );
                step.discard(BRONCH_DILATION, reason.as_str());
                step.warn(reason);
            }
        }
    }

    if step.has(BRONCH_DIAGNOSTIC) {
        let surgical = codes
            .iter()
            .find(|code| {
                code.starts_with("316")
                    && code.as_str() != BRONCH_DIAGNOSTIC
                    && !knowledge.is_add_on(code)
            })
            .cloned();
        if let Some(surgical) = surgical {
            step.discard(
                BRONCH_DIAGNOSTIC,
                format!("diagnostic bronchoscopy bundled into {surgical}"),
            );
        }
    }
    step
}

fn add_on_suppression(codes: &CodeSet, knowledge: &KnowledgeBase) -> RuleStep {
    let mut step = RuleStep::begin("REG-ADDON", codes);
    let (_, dropped) = gate_add_ons(codes, knowledge);
    for drop in dropped {
        step.discard(&drop.code, drop.reason.as_str());
        step.warn(drop.reason);
    }
    step
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{derive_from_registry, value_is_truthy};
    use crate::domain::registry::{RegistryProcedure, RegistryRecord};
    use crate::knowledge::KnowledgeBase;
    use crate::rules::RuleAction;

    fn knowledge() -> KnowledgeBase {
        KnowledgeBase::builtin().expect("builtin knowledge")
    }

    #[test]
    fn stent_with_dilation_bundles_the_dilation() {
        let record: RegistryRecord = serde_json::from_value(json!({
            "airway_stent": {"performed": true},
            "airway_dilation": {"performed": true}
        }))
        .expect("record");

        let derivation = derive_from_registry(&record, &knowledge());

        assert_eq!(derivation.codes.iter().collect::<Vec<_>>(), ["31636"]);
        assert!(derivation
            .warnings
            .iter()
            .any(|warning| warning.contains("31630 bundled into 31636")));
        let discard = derivation
            .trace
            .iter()
            .find(|entry| entry.code == "31630")
            .expect("dilation trace entry");
        assert_eq!(discard.action, RuleAction::Discard);
        assert_eq!(discard.rule_id, "REG-BUNDLE");
    }

    #[test]
    fn dilation_at_a_distinct_location_is_kept() {
        let record = RegistryRecord::default()
            .with(
                "airway_stent",
                RegistryProcedure::performed().with_detail("location", json!("left main bronchus")),
            )
            .with(
                "airway_dilation",
                RegistryProcedure::performed()
                    .with_detail("location", json!("bronchus intermedius")),
            );

        let derivation = derive_from_registry(&record, &knowledge());
        assert!(derivation.codes.contains("31630"));
        assert!(derivation.codes.contains("31636"));
    }

    #[test]
    fn station_count_selects_one_ebus_code() {
        let record = RegistryRecord::default().with(
            "linear_ebus",
            RegistryProcedure::performed().with_detail("stations", json!(["4R", "7", "10R", "7"])),
        );
        let derivation = derive_from_registry(&record, &knowledge());
        assert_eq!(derivation.codes.iter().collect::<Vec<_>>(), ["31653"]);
    }

    #[test]
    fn imaging_guided_thoracentesis_wins_over_blind() {
        let record = RegistryRecord::default()
            .with(
                "thoracentesis",
                RegistryProcedure::performed().with_detail("guidance", json!("ultrasound")),
            );
        let derivation = derive_from_registry(&record, &knowledge());
        assert_eq!(derivation.codes.iter().collect::<Vec<_>>(), ["32555"]);
    }

    #[test]
    fn add_on_without_primary_is_suppressed() {
        let record = RegistryRecord::default().with("radial_ebus", RegistryProcedure::performed());
        let derivation = derive_from_registry(&record, &knowledge());
        assert!(derivation.codes.is_empty());
        assert!(derivation.warnings.iter().any(|warning| warning.contains("31654")));
    }

    #[test]
    fn not_performed_procedures_contribute_nothing() {
        let record: RegistryRecord = serde_json::from_value(json!({
            "bal": {"performed": false},
            "transbronchial_biopsy": {"performed": true, "lobes": ["RUL", "RLL"]}
        }))
        .expect("record");
        let derivation = derive_from_registry(&record, &knowledge());
        assert_eq!(derivation.codes.iter().collect::<Vec<_>>(), ["31628", "31632"]);
    }

    #[test]
    fn truthy_registry_values() {
        assert!(value_is_truthy(Some(&json!(true))));
        assert!(value_is_truthy(Some(&json!(2))));
        assert!(value_is_truthy(Some(&json!("Yes"))));
        assert!(!value_is_truthy(Some(&json!("no"))));
        assert!(!value_is_truthy(Some(&json!(0))));
        assert!(!value_is_truthy(None));
    }

    #[test]
    fn ultrasound_flag_in_details_selects_the_guided_thoracentesis() {
        let record: RegistryRecord = serde_json::from_value(json!({
            "thoracentesis": {"performed": true, "ultrasound_guided": "yes"}
        }))
        .expect("record");
        let derivation = derive_from_registry(&record, &knowledge());
        assert_eq!(derivation.codes.iter().collect::<Vec<_>>(), ["32555"]);
    }
}
