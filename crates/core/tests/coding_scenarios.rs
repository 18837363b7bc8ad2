use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use ipcoder_core::compliance::hierarchy::HierarchyNormalizer;
use ipcoder_core::compliance::ncci::{ModifierIndicator, NcciEdit, NcciGatekeeper};
use ipcoder_core::hybrid::{AdvisorResult, MergeInput, RuleResult};
use ipcoder_core::{
    CodeCandidate, CodingEvidence, CodingOrchestrator, CodingRequest, EvidenceContext,
    EvidenceInput, HybridDecision, HybridPolicy, KnowledgeBase, KnowledgeSource, KnowledgeStore,
    MerCalculator, MerLine, MerRole, RegistryProcedure, RegistryRecord, RuleEngine, RuleSource,
};
use rust_decimal::Decimal;
use serde_json::json;

fn codes(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(|value| value.to_string()).collect()
}

fn builtin() -> KnowledgeBase {
    KnowledgeBase::builtin().expect("builtin knowledge base")
}

fn registry_request(record: RegistryRecord) -> CodingRequest {
    CodingRequest::new(CodingEvidence::Registry { note_id: None, text: String::new(), record })
        .with_policy("rules_only")
}

fn orchestrator() -> CodingOrchestrator {
    let store = KnowledgeStore::with_knowledge(KnowledgeSource::Builtin, builtin());
    CodingOrchestrator::new(Arc::new(store))
}

#[test]
fn linear_ebus_with_three_stations_codes_the_higher_station_code() {
    let evidence = EvidenceContext::build(EvidenceInput {
        groups: vec!["bronchoscopy_ebus_linear".into()],
        evidence: BTreeMap::from([(
            "bronchoscopy_ebus_linear".to_string(),
            json!({"station_count": 3}).as_object().cloned().expect("object"),
        )]),
        ..EvidenceInput::default()
    })
    .expect("evidence");

    let result = RuleEngine::new(RuleSource::Native).evaluate(&evidence, &builtin());

    assert_eq!(result.codes, codes(&["31653"]));
    assert!(result.check_invariants().is_ok());
}

#[test]
fn ncci_indicator_decides_whether_a_pair_bundles() {
    let input = codes(&["31653", "31645"]);

    let strict = [NcciEdit::new("31653", "31645", ModifierIndicator::NotAllowed)];
    let result = NcciGatekeeper::new(&strict).apply(&input);
    assert_eq!(result.allowed, codes(&["31653"]));
    assert_eq!(result.bundled, BTreeMap::from([("31645".to_string(), "31653".to_string())]));

    let lenient = [NcciEdit::new("31653", "31645", ModifierIndicator::Allowed)];
    let result = NcciGatekeeper::new(&lenient).apply(&input);
    assert_eq!(result.allowed, input);
    assert!(result.bundled.is_empty());
}

#[test]
fn mer_assigns_primary_secondary_and_add_on_roles() {
    let calculator = MerCalculator::default();
    let summary = calculator.calculate(&[
        MerLine::base("31652", Decimal::new(400, 0)),
        MerLine::base("31628", Decimal::new(250, 0)),
        MerLine::add_on("+31654", Decimal::new(150, 0)),
    ]);

    let primary = summary.for_code("31652").expect("31652");
    assert_eq!((primary.role, primary.payment_amount), (MerRole::Primary, Decimal::new(400, 0)));
    let secondary = summary.for_code("31628").expect("31628");
    assert_eq!(
        (secondary.role, secondary.payment_amount),
        (MerRole::Secondary, Decimal::new(125, 0))
    );
    let add_on = summary.for_code("31654").expect("31654");
    assert_eq!((add_on.role, add_on.payment_amount), (MerRole::AddOn, Decimal::new(150, 0)));
}

#[test]
fn hierarchy_normalizer_is_idempotent_on_builtin_families() {
    let knowledge = builtin();
    let normalizer = HierarchyNormalizer::new(knowledge.families());
    let candidates: Vec<CodeCandidate> =
        ["31631", "31636", "31652", "31653", "31628"].iter().map(CodeCandidate::new).collect();

    let once = normalizer.apply(&candidates);
    let twice = normalizer.apply(&once.candidates);

    assert_eq!(twice.candidates, once.candidates);
    assert!(twice.conversions.is_empty());
    let result: BTreeSet<String> = once.candidates.iter().map(|c| c.code().to_string()).collect();
    assert_eq!(result, codes(&["31628", "31631", "31637", "31653"]));
}

#[test]
fn agreement_always_wins_regardless_of_confidence() {
    let knowledge = builtin();
    let rules = RuleResult::new().with("31628", 0.1);
    let advisor = AdvisorResult::new().with("31628", 0.05);
    let valid = knowledge.valid_codes();
    let discards = BTreeMap::new();

    let merged = HybridPolicy::default()
        .merge(
            MergeInput {
                rules: &rules,
                advisor: Some(&advisor),
                text: "",
                valid_codes: &valid,
                keywords: knowledge.keywords(),
                rule_discards: &discards,
            },
            "smart_hybrid",
        )
        .expect("known policy");

    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].decision(), HybridDecision::AcceptedAgreement);
}

#[tokio::test]
async fn stent_with_dilation_registry_record_bundles_the_dilation() {
    let record = RegistryRecord::default()
        .with("airway_stent", RegistryProcedure::performed())
        .with("airway_dilation", RegistryProcedure::performed());

    let report = orchestrator().code(registry_request(record)).await.expect("report");

    assert_eq!(report.code_set(), codes(&["31636"]));
    assert!(report.warnings.iter().any(|warning| warning.contains("31630")));
}

#[tokio::test]
async fn imaging_guided_thoracentesis_never_keeps_the_blind_code() {
    let record = RegistryRecord::default().with(
        "thoracentesis",
        RegistryProcedure::performed().with_detail("imaging_guided", json!(true)),
    );
    let report = orchestrator().code(registry_request(record)).await.expect("report");

    assert_eq!(report.code_set(), codes(&["32555"]));
}

#[tokio::test]
async fn add_on_only_registry_record_codes_nothing() {
    let record = RegistryRecord::default().with("radial_ebus", RegistryProcedure::performed());
    let report = orchestrator().code(registry_request(record)).await.expect("report");

    assert!(report.codes.is_empty());
}

#[test]
fn coding_request_reads_from_json() {
    let request: CodingRequest = serde_json::from_value(json!({
        "policy": "rules_only",
        "evidence": {
            "source": "context",
            "note_id": "n-7",
            "text": "Transbronchial biopsy of the right lower lobe.",
            "candidates": [{"code": "31628"}]
        }
    }))
    .expect("request parses");

    assert_eq!(request.policy.as_deref(), Some("rules_only"));
    assert_eq!(request.evidence.note_id(), Some("n-7"));
}
