pub mod advisor;
pub mod audit;
pub mod compliance;
pub mod config;
pub mod domain;
pub mod errors;
pub mod hybrid;
pub mod knowledge;
pub mod orchestrator;
pub mod rules;

pub use advisor::{AdvisorError, AdvisorSuggestion, CodeAdvisor};
pub use audit::{AuditEvent, AuditSink, InMemoryAuditSink, NoopAuditSink};
pub use compliance::mer::{MerAdjustment, MerCalculator, MerLine, MerRole, MerSummary};
pub use compliance::ncci::{NcciGatekeeper, NcciResult};
pub use config::{CoderConfig, ConfigError, ConfigOverrides, LoadOptions};
pub use domain::candidate::CodeCandidate;
pub use domain::evidence::{EvidenceContext, EvidenceInput};
pub use domain::registry::{RegistryProcedure, RegistryRecord};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use hybrid::{HybridCandidate, HybridDecision, HybridPolicy, HybridSettings, MergePolicy};
pub use knowledge::store::{KnowledgeSource, KnowledgeStore};
pub use knowledge::{KnowledgeBase, KnowledgeError};
pub use orchestrator::{
    AdvisorStatus, CodingEvidence, CodingOrchestrator, CodingReport, CodingRequest, FinalCode,
    ReviewFlag,
};
pub use rules::{RuleEngine, RuleSource, RulesResult};
