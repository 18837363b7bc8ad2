//! End-to-end coding pipeline for one note.
//!
//! Stages run in a fixed order: rules (or registry derivation), hierarchy,
//! NCCI, advisor, hybrid merge, post-merge compliance, add-on gate, MER and
//! report assembly. Only the advisor call suspends; it is bounded by a
//! timeout and any failure downgrades the request to rules-only.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::advisor::{AdvisorSuggestion, CodeAdvisor};
use crate::audit::{AuditCategory, AuditContext, AuditOutcome, AuditSink, NoopAuditSink};
use crate::compliance::addon::{gate_add_ons, AddOnDrop};
use crate::compliance::exclusive::enforce_exclusive;
use crate::compliance::hierarchy::{FamilyConversion, HierarchyNormalizer};
use crate::compliance::mer::{MerCalculator, MerLine, MerRole, MerSummary};
use crate::compliance::ncci::NcciGatekeeper;
use crate::config::CoderConfig;
use crate::domain::candidate::CodeCandidate;
use crate::domain::evidence::{EvidenceContext, EvidenceInput};
use crate::domain::registry::RegistryRecord;
use crate::errors::ApplicationError;
use crate::hybrid::{
    AdvisorResult, HybridCandidate, HybridDecision, HybridPolicy, MergeInput, MergePolicy,
    RuleResult,
};
use crate::knowledge::store::KnowledgeStore;
use crate::knowledge::KnowledgeBase;
use crate::rules::{RuleEngine, RulesResult, ShadowDiff, TraceEntry};

pub const DISTINCT_SITE_MODIFIER: &str = "59";
pub const MULTIPLE_PROCEDURE_MODIFIER: &str = "51";
const DEFAULT_ADVISOR_TIMEOUT: Duration = Duration::from_secs(20);

/// What the upstream extractor produced for the note.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum CodingEvidence {
    Context(EvidenceInput),
    Registry {
        #[serde(default)]
        note_id: Option<String>,
        #[serde(default)]
        text: String,
        record: RegistryRecord,
    },
}

impl CodingEvidence {
    pub fn note_id(&self) -> Option<&str> {
        match self {
            Self::Context(input) => input.note_id.as_deref(),
            Self::Registry { note_id, .. } => note_id.as_deref(),
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Self::Context(input) => &input.text,
            Self::Registry { text, .. } => text,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CodingRequest {
    pub evidence: CodingEvidence,
    /// Policy name; the orchestrator default applies when absent.
    #[serde(default)]
    pub policy: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

impl CodingRequest {
    pub fn new(evidence: CodingEvidence) -> Self {
        Self { evidence, policy: None, correlation_id: None }
    }

    pub fn with_policy(mut self, policy: impl Into<String>) -> Self {
        self.policy = Some(policy.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum AdvisorStatus {
    NotRequested,
    NotConfigured,
    Succeeded,
    TimedOut,
    Failed(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewFlag {
    Optional,
    Recommended,
    Required,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FinalCode {
    pub code: String,
    pub display_code: String,
    pub description: Option<String>,
    pub confidence: f64,
    pub reason: Option<String>,
    pub modifiers: Vec<String>,
    pub mer_role: MerRole,
    pub allowed_amount: Decimal,
    pub payment_amount: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<HybridDecision>,
    pub review_flag: ReviewFlag,
    pub needs_distinct_site_modifier: bool,
    pub compliance_notes: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CodingReport {
    pub note_id: Option<String>,
    pub correlation_id: String,
    pub policy_requested: MergePolicy,
    pub policy_applied: MergePolicy,
    pub rule_source: String,
    pub advisor_status: AdvisorStatus,
    pub codes: Vec<FinalCode>,
    pub hybrid: Vec<HybridCandidate>,
    pub rules_trace: Vec<TraceEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shadow_diff: Option<ShadowDiff>,
    pub family_conversions: Vec<FamilyConversion>,
    /// `bundled[column2] = column1`
    pub ncci_bundled: BTreeMap<String, String>,
    pub add_ons_dropped: Vec<AddOnDrop>,
    pub mer: MerSummary,
    pub warnings: Vec<String>,
    pub knowledge_fingerprint: String,
}

impl CodingReport {
    pub fn code_set(&self) -> BTreeSet<String> {
        self.codes.iter().map(|code| code.code.clone()).collect()
    }

    pub fn final_code(&self, code: &str) -> Option<&FinalCode> {
        self.codes.iter().find(|entry| entry.code == code)
    }
}

pub struct CodingOrchestrator {
    knowledge: Arc<KnowledgeStore>,
    rules: RuleEngine,
    hybrid: HybridPolicy,
    default_policy: MergePolicy,
    advisor: Option<Arc<dyn CodeAdvisor>>,
    advisor_timeout: Duration,
}

struct RuleStage {
    note_id: Option<String>,
    text: String,
    rules: RulesResult,
    candidates: Vec<CodeCandidate>,
    /// Candidate codes in the order the extractor listed them.
    input_order: Vec<String>,
}

struct PostMerge {
    codes: BTreeSet<String>,
    conversions: Vec<FamilyConversion>,
    bundled: BTreeMap<String, String>,
    modifier_pairs: BTreeMap<String, String>,
}

impl CodingOrchestrator {
    pub fn new(knowledge: Arc<KnowledgeStore>) -> Self {
        Self {
            knowledge,
            rules: RuleEngine::default(),
            hybrid: HybridPolicy::default(),
            default_policy: MergePolicy::SmartHybrid,
            advisor: None,
            advisor_timeout: DEFAULT_ADVISOR_TIMEOUT,
        }
    }

    /// Builds the orchestrator from loaded configuration. The advisor is
    /// passed in because constructing one is the advisor crate's concern.
    pub fn from_config(
        config: &CoderConfig,
        knowledge: Arc<KnowledgeStore>,
        advisor: Option<Arc<dyn CodeAdvisor>>,
    ) -> Result<Self, ApplicationError> {
        let rules = RuleEngine::new(config.rules.rule_source()?);
        let mut orchestrator = Self::new(knowledge)
            .with_rule_engine(rules)
            .with_hybrid_policy(HybridPolicy::new(config.hybrid.settings()))
            .with_default_policy(config.hybrid.policy);
        orchestrator.advisor_timeout = Duration::from_secs(config.advisor.timeout_secs);
        orchestrator.advisor = advisor;
        Ok(orchestrator)
    }

    pub fn with_rule_engine(mut self, rules: RuleEngine) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_hybrid_policy(mut self, hybrid: HybridPolicy) -> Self {
        self.hybrid = hybrid;
        self
    }

    pub fn with_default_policy(mut self, policy: MergePolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn with_advisor(mut self, advisor: Arc<dyn CodeAdvisor>, timeout: Duration) -> Self {
        self.advisor = Some(advisor);
        self.advisor_timeout = timeout;
        self
    }

    pub fn knowledge(&self) -> &KnowledgeStore {
        &self.knowledge
    }

    pub fn default_policy(&self) -> MergePolicy {
        self.default_policy
    }

    pub async fn code(&self, request: CodingRequest) -> Result<CodingReport, ApplicationError> {
        self.code_with_audit(request, &NoopAuditSink).await
    }

    pub async fn code_with_audit<S: AuditSink + ?Sized>(
        &self,
        request: CodingRequest,
        sink: &S,
    ) -> Result<CodingReport, ApplicationError> {
        let policy_requested = match request.policy.as_deref() {
            Some(name) => name.parse::<MergePolicy>()?,
            None => self.default_policy,
        };
        let correlation_id = request
            .correlation_id
            .clone()
            .or_else(|| request.evidence.note_id().map(str::to_string))
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let knowledge = self.knowledge.snapshot();
        let audit = AuditContext::new(
            request.evidence.note_id().map(str::to_string),
            correlation_id.clone(),
            "coding-orchestrator",
        );

        let stage = self.evaluate_rules(request.evidence, &knowledge)?;
        let note_label = stage.note_id.clone().unwrap_or_else(|| "-".to_string());
        sink.emit(
            audit
                .event("coding.rules.evaluated", AuditCategory::Rules, AuditOutcome::Success)
                .with_metadata("source", self.rules.source().label())
                .with_metadata("codes", join(&stage.rules.codes))
                .with_metadata("trace_entries", stage.rules.trace.len().to_string()),
        );

        let hierarchy = HierarchyNormalizer::new(knowledge.families()).apply(&stage.candidates);
        let mut conversions = hierarchy.conversions;
        for conversion in &conversions {
            info!(
                event_name = "coding.hierarchy.converted",
                correlation_id = %correlation_id,
                note_id = %note_label,
                family = %conversion.family,
                from = %conversion.from,
                to = %conversion.to,
                "code family conversion applied"
            );
            sink.emit(
                audit
                    .event(
                        "coding.hierarchy.converted",
                        AuditCategory::Compliance,
                        AuditOutcome::Success,
                    )
                    .with_metadata("from", conversion.from.clone())
                    .with_metadata("to", conversion.to.clone()),
            );
        }

        let normalized: BTreeSet<String> =
            hierarchy.candidates.iter().map(|candidate| candidate.code().to_string()).collect();
        let ncci = NcciGatekeeper::new(knowledge.ncci_edits()).apply(&normalized);
        let mut ncci_bundled = ncci.bundled.clone();
        self.log_bundles(&ncci.bundled, &correlation_id, &note_label, &audit, sink);
        let surviving: Vec<CodeCandidate> = hierarchy
            .candidates
            .into_iter()
            .filter(|candidate| ncci.allowed.contains(candidate.code()))
            .collect();

        let mut warnings = stage.rules.warnings.clone();
        let (advisor_status, suggestions) = match policy_requested {
            MergePolicy::RulesOnly => (AdvisorStatus::NotRequested, None),
            MergePolicy::SmartHybrid => self.consult_advisor(&stage.text, &correlation_id).await,
        };
        if let Some(message) = fallback_message(&advisor_status) {
            warn!(
                event_name = "coding.advisor.fallback",
                correlation_id = %correlation_id,
                note_id = %note_label,
                reason = %message,
                "advisor unavailable, continuing with rules only"
            );
            sink.emit(
                audit
                    .event(
                        "coding.advisor.fallback",
                        AuditCategory::Advisor,
                        AuditOutcome::Degraded,
                    )
                    .with_metadata("reason", message.clone()),
            );
            warnings.push(message);
        }
        let policy_applied = match (policy_requested, &suggestions) {
            (MergePolicy::SmartHybrid, Some(_)) => MergePolicy::SmartHybrid,
            _ => MergePolicy::RulesOnly,
        };

        let rule_result: RuleResult = RuleResult::from_candidates(&surviving);
        let advisor_result: Option<AdvisorResult> =
            suggestions.as_deref().map(AdvisorResult::from_suggestions);
        let valid_codes = knowledge.valid_codes();
        let rule_discards = stage.rules.discarded_by();
        let mut hybrid = self.hybrid.merge_with(
            MergeInput {
                rules: &rule_result,
                advisor: advisor_result.as_ref(),
                text: &stage.text,
                valid_codes: &valid_codes,
                keywords: knowledge.keywords(),
                rule_discards: &rule_discards,
            },
            policy_applied,
        );
        let decisions = decision_counts(&hybrid);
        info!(
            event_name = "coding.hybrid.merged",
            correlation_id = %correlation_id,
            note_id = %note_label,
            policy = %policy_applied,
            decisions = ?decisions,
            "hybrid merge finished"
        );
        sink.emit(
            audit
                .event("coding.hybrid.merged", AuditCategory::Hybrid, AuditOutcome::Success)
                .with_metadata("policy", policy_applied.as_str())
                .with_metadata("candidates", hybrid.len().to_string()),
        );

        let post = post_merge_compliance(&mut hybrid, &knowledge);
        self.log_bundles(&post.bundled, &correlation_id, &note_label, &audit, sink);
        ncci_bundled.extend(post.bundled);
        conversions.extend(post.conversions);

        let (final_set, add_ons_dropped) = gate_add_ons(&post.codes, &knowledge);
        for drop in &add_ons_dropped {
            for candidate in hybrid.iter_mut().filter(|candidate| candidate.code() == drop.code) {
                if candidate.decision().is_retained() {
                    candidate.record_add_on_dropped();
                }
            }
            info!(
                event_name = "coding.addon.dropped",
                correlation_id = %correlation_id,
                note_id = %note_label,
                code = %drop.code,
                reason = %drop.reason,
                "add-on code dropped"
            );
            sink.emit(
                audit
                    .event(
                        "coding.addon.dropped",
                        AuditCategory::Compliance,
                        AuditOutcome::Rejected,
                    )
                    .with_metadata("code", drop.code.clone())
                    .with_metadata("reason", drop.reason.clone()),
            );
            warnings.push(drop.reason.clone());
        }

        let order = billing_order(
            &stage.input_order,
            &stage.rules.trace,
            &conversions,
            suggestions.as_deref(),
        );
        let mut billed: Vec<&String> = final_set.iter().collect();
        billed.sort_by_key(|code| (order.get(code.as_str()).copied().unwrap_or(usize::MAX), *code));
        let lines: Vec<MerLine> = billed
            .into_iter()
            .map(|code| {
                let allowed = knowledge.allowed_amount(code);
                if knowledge.is_add_on(code) {
                    MerLine::add_on(code, allowed)
                } else {
                    MerLine::base(code, allowed)
                }
            })
            .collect();
        let mer = MerCalculator::new(knowledge.add_on_codes()).calculate(&lines);

        let reasons = reason_index(&surviving, suggestions.as_deref());
        let codes = assemble_codes(
            &final_set,
            &hybrid,
            &mer,
            &post.modifier_pairs,
            &conversions,
            &reasons,
            policy_applied,
            &knowledge,
        );

        debug!(
            event_name = "coding.report.assembled",
            correlation_id = %correlation_id,
            note_id = %note_label,
            codes = codes.len(),
            total_allowed = %mer.total_allowed,
            total_payment = %mer.total_payment,
            "final code list assembled"
        );
        sink.emit(
            audit
                .event("coding.report.finalized", AuditCategory::Report, AuditOutcome::Success)
                .with_metadata("codes", join(&final_set))
                .with_metadata("policy", policy_applied.as_str())
                .with_metadata("knowledge_fingerprint", knowledge.fingerprint()),
        );

        Ok(CodingReport {
            note_id: stage.note_id,
            correlation_id,
            policy_requested,
            policy_applied,
            rule_source: self.rules.source().label().to_string(),
            advisor_status,
            codes,
            hybrid,
            rules_trace: stage.rules.trace,
            shadow_diff: stage.rules.shadow_diff,
            family_conversions: conversions,
            ncci_bundled,
            add_ons_dropped,
            mer,
            warnings,
            knowledge_fingerprint: knowledge.fingerprint().to_string(),
        })
    }

    fn evaluate_rules(
        &self,
        evidence: CodingEvidence,
        knowledge: &KnowledgeBase,
    ) -> Result<RuleStage, ApplicationError> {
        match evidence {
            CodingEvidence::Context(input) => {
                let text = input.text.clone();
                let context = EvidenceContext::build(input)?;
                let rules = self.rules.evaluate(&context, knowledge);
                rules.check_invariants()?;
                let candidates = rules.to_candidates(&context);
                let input_order = context
                    .candidates()
                    .iter()
                    .map(|candidate| candidate.code().to_string())
                    .collect();
                Ok(RuleStage {
                    note_id: context.note_id().map(str::to_string),
                    text,
                    rules,
                    candidates,
                    input_order,
                })
            }
            CodingEvidence::Registry { note_id, text, record } => {
                let rules: RulesResult =
                    crate::rules::registry::derive_from_registry(&record, knowledge).into();
                rules.check_invariants()?;
                let context = EvidenceContext::build(EvidenceInput {
                    note_id: note_id.clone(),
                    text: text.clone(),
                    ..EvidenceInput::default()
                })?;
                let candidates = rules.to_candidates(&context);
                Ok(RuleStage { note_id, text, rules, candidates, input_order: Vec::new() })
            }
        }
    }

    async fn consult_advisor(
        &self,
        text: &str,
        correlation_id: &str,
    ) -> (AdvisorStatus, Option<Vec<AdvisorSuggestion>>) {
        let Some(advisor) = &self.advisor else {
            return (AdvisorStatus::NotConfigured, None);
        };

        match tokio::time::timeout(self.advisor_timeout, advisor.suggest_codes(text)).await {
            Ok(Ok(suggestions)) => {
                debug!(
                    event_name = "coding.advisor.completed",
                    correlation_id = %correlation_id,
                    advisor = advisor.name(),
                    suggestions = suggestions.len(),
                    "advisor suggestions received"
                );
                (AdvisorStatus::Succeeded, Some(suggestions))
            }
            Ok(Err(error)) => (AdvisorStatus::Failed(error.to_string()), None),
            Err(_) => (AdvisorStatus::TimedOut, None),
        }
    }

    fn log_bundles<S: AuditSink + ?Sized>(
        &self,
        bundled: &BTreeMap<String, String>,
        correlation_id: &str,
        note_label: &str,
        audit: &AuditContext,
        sink: &S,
    ) {
        for (column2, column1) in bundled {
            info!(
                event_name = "coding.ncci.bundled",
                correlation_id = %correlation_id,
                note_id = %note_label,
                bundled = %column2,
                into = %column1,
                "NCCI edit bundled a code"
            );
            sink.emit(
                audit
                    .event("coding.ncci.bundled", AuditCategory::Compliance, AuditOutcome::Rejected)
                    .with_metadata("code", column2.clone())
                    .with_metadata("into", column1.clone()),
            );
        }
    }
}

fn fallback_message(status: &AdvisorStatus) -> Option<String> {
    match status {
        AdvisorStatus::NotRequested | AdvisorStatus::Succeeded => None,
        AdvisorStatus::NotConfigured => {
            Some("advisor not configured; smart_hybrid ran as rules_only".to_string())
        }
        AdvisorStatus::TimedOut => {
            Some("advisor timed out; smart_hybrid ran as rules_only".to_string())
        }
        AdvisorStatus::Failed(error) => {
            Some(format!("advisor failed ({error}); smart_hybrid ran as rules_only"))
        }
    }
}

/// Advisor-added codes never passed through the pre-merge stages, so the
/// retained set goes through hierarchy, NCCI and exclusive pairs again. Each
/// change is recorded on the affected hybrid candidate.
fn post_merge_compliance(hybrid: &mut [HybridCandidate], knowledge: &KnowledgeBase) -> PostMerge {
    let retained: BTreeSet<String> = hybrid
        .iter()
        .filter(|candidate| candidate.decision().is_retained())
        .map(|candidate| candidate.code().to_string())
        .collect();

    let (converted, conversions) =
        HierarchyNormalizer::new(knowledge.families()).apply_codes(&retained);
    for conversion in &conversions {
        for candidate in hybrid.iter_mut() {
            if candidate.code() == conversion.from && candidate.decision().is_retained() {
                candidate.record_family_conversion(&conversion.to);
            }
        }
    }

    let ncci = NcciGatekeeper::new(knowledge.ncci_edits()).apply(&converted);
    for (column2, column1) in &ncci.bundled {
        for candidate in hybrid.iter_mut() {
            if candidate.code() == column2 && candidate.decision().is_retained() {
                candidate.record_bundled(column1);
            }
        }
    }

    let (codes, applied) = enforce_exclusive(&ncci.allowed, knowledge.exclusive_pairs());
    for pair in &applied {
        for candidate in hybrid.iter_mut() {
            if candidate.code() == pair.loser && candidate.decision().is_retained() {
                candidate.record_excluded(&pair.winner);
            }
        }
    }

    let modifier_pairs = ncci
        .modifier_eligible
        .iter()
        .filter(|pair| codes.contains(&pair.column1) && codes.contains(&pair.column2))
        .map(|pair| (pair.column2.clone(), pair.column1.clone()))
        .collect();

    PostMerge { codes, conversions, bundled: ncci.bundled, modifier_pairs }
}

/// Rank of each code for MER tie-breaking: input candidates first, then
/// codes rules added, then advisor suggestions. A code that replaced another
/// through an upgrade or family conversion takes the rank of the code it
/// replaced.
fn billing_order(
    input_order: &[String],
    trace: &[TraceEntry],
    conversions: &[FamilyConversion],
    suggestions: Option<&[AdvisorSuggestion]>,
) -> BTreeMap<String, usize> {
    let mut ranks: BTreeMap<String, usize> = BTreeMap::new();
    let mut next = 0;
    let mut rank_new = |ranks: &mut BTreeMap<String, usize>, code: &str, inherited: Option<usize>| {
        if !ranks.contains_key(code) {
            let rank = inherited.unwrap_or_else(|| {
                next += 1;
                next - 1
            });
            ranks.insert(code.to_string(), rank);
        }
    };

    for code in input_order {
        rank_new(&mut ranks, code, None);
    }
    for entry in trace {
        if let Some(code) = entry.resulting_code() {
            let inherited = entry.removed_code().and_then(|from| ranks.get(from).copied());
            rank_new(&mut ranks, code, inherited);
        }
    }
    for suggestion in suggestions.unwrap_or_default() {
        rank_new(&mut ranks, &crate::domain::cpt::normalize_code(&suggestion.code), None);
    }
    for conversion in conversions {
        let inherited = ranks.get(&conversion.from).copied();
        rank_new(&mut ranks, &conversion.to, inherited);
    }
    ranks
}

fn reason_index(
    candidates: &[CodeCandidate],
    suggestions: Option<&[AdvisorSuggestion]>,
) -> BTreeMap<String, String> {
    let mut reasons = BTreeMap::new();
    for suggestion in suggestions.unwrap_or_default() {
        if !suggestion.rationale.trim().is_empty() {
            reasons.insert(
                crate::domain::cpt::normalize_code(&suggestion.code),
                format!("advisor: {}", suggestion.rationale.trim()),
            );
        }
    }
    for candidate in candidates {
        if let Some(reason) = candidate.reason() {
            reasons.insert(candidate.code().to_string(), reason.to_string());
        }
    }
    reasons
}

#[allow(clippy::too_many_arguments)]
fn assemble_codes(
    final_set: &BTreeSet<String>,
    hybrid: &[HybridCandidate],
    mer: &MerSummary,
    modifier_pairs: &BTreeMap<String, String>,
    conversions: &[FamilyConversion],
    reasons: &BTreeMap<String, String>,
    policy: MergePolicy,
    knowledge: &KnowledgeBase,
) -> Vec<FinalCode> {
    final_set
        .iter()
        .map(|code| {
            let merged = hybrid
                .iter()
                .filter(|candidate| candidate.code() == code && candidate.decision().is_retained())
                .max_by(|left, right| left.confidence().total_cmp(&right.confidence()));
            let adjustment = mer.for_code(code);
            let mer_role = adjustment.map(|adjustment| adjustment.role).unwrap_or(MerRole::AddOn);
            let needs_distinct_site = modifier_pairs.contains_key(code);

            let mut modifiers = Vec::new();
            let mut notes = Vec::new();
            if mer_role == MerRole::Secondary {
                modifiers.push(MULTIPLE_PROCEDURE_MODIFIER.to_string());
                notes.push("multiple endoscopy rule: secondary procedure paid at 50%".to_string());
            }
            if let Some(column1) = modifier_pairs.get(code) {
                modifiers.push(DISTINCT_SITE_MODIFIER.to_string());
                notes.push(format!(
                    "modifier {DISTINCT_SITE_MODIFIER} pending confirmation: \
                     distinct site from {column1} must be documented"
                ));
            }
            for conversion in conversions.iter().filter(|conversion| conversion.to == *code) {
                notes.push(conversion.provenance());
            }

            let decision = merged
                .map(HybridCandidate::decision)
                .filter(|_| policy == MergePolicy::SmartHybrid);
            let review_flag = match decision {
                Some(HybridDecision::HumanReviewRequired) => ReviewFlag::Required,
                Some(HybridDecision::AcceptedHybrid) => ReviewFlag::Recommended,
                _ if needs_distinct_site => ReviewFlag::Recommended,
                _ => ReviewFlag::Optional,
            };
            let reason = reasons
                .get(code)
                .cloned()
                .or_else(|| {
                    conversions
                        .iter()
                        .find(|conversion| conversion.to == *code)
                        .map(FamilyConversion::provenance)
                });

            FinalCode {
                code: code.clone(),
                display_code: knowledge.display_code(code),
                description: knowledge.description(code).map(str::to_string),
                confidence: merged.map(HybridCandidate::confidence).unwrap_or_default(),
                reason,
                modifiers,
                mer_role,
                allowed_amount: adjustment
                    .map(|adjustment| adjustment.allowed_amount)
                    .unwrap_or_default(),
                payment_amount: adjustment
                    .map(|adjustment| adjustment.payment_amount)
                    .unwrap_or_default(),
                decision,
                review_flag,
                needs_distinct_site_modifier: needs_distinct_site,
                compliance_notes: notes,
            }
        })
        .collect()
}

fn decision_counts(hybrid: &[HybridCandidate]) -> BTreeMap<HybridDecision, usize> {
    let mut counts = BTreeMap::new();
    for candidate in hybrid {
        *counts.entry(candidate.decision()).or_insert(0) += 1;
    }
    counts
}

fn join(codes: &BTreeSet<String>) -> String {
    codes.iter().map(String::as_str).collect::<Vec<_>>().join(",")
}
