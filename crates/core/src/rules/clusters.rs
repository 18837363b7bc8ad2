//! Native rule clusters R001-R018.
//!
//! Clusters that cannot establish sufficient evidence discard the code; they
//! never keep a code on ambiguity.


use super::{CodeSet, NativeRule, RuleContext, RuleStep};
use crate::domain::cpt::{
    BRONCH_ASPIRATION_INITIAL, BRONCH_ASPIRATION_SUBSEQUENT, BRONCH_BAL, BRONCH_BRUSHING,
    BRONCH_DIAGNOSTIC, BRONCH_DILATION, BRONCH_ENDOBRONCHIAL_BIOPSY, BRONCH_FIDUCIAL,
    BRONCH_NAVIGATION, BRONCH_STENT_ADDITIONAL, BRONCH_STENT_BRONCHIAL, BRONCH_STENT_REVISION,
    BRONCH_STENT_TRACHEAL, BRONCH_TBLB, BRONCH_TBLB_ADDITIONAL_LOBE, BRONCH_TBNA,
    BRONCH_TBNA_ADDITIONAL_LOBE, BRONCH_TUMOR_DESTRUCTION, BRONCH_TUMOR_EXCISION,
    BRONCH_VALVE_ADDITIONAL, BRONCH_VALVE_INITIAL, BRONCH_VALVE_REMOVAL,
    BRONCH_VALVE_REMOVAL_ADDITIONAL, EBUS_RADIAL, EBUS_TBNA_ONE_TWO_STATIONS,
    EBUS_TBNA_THREE_PLUS_STATIONS, PLEURAL_DRAIN_BLIND, PLEURAL_DRAIN_IMAGING,
    PLEURAL_IPC_PLACEMENT, PLEURAL_IPC_REMOVAL, THORACENTESIS_BLIND, THORACENTESIS_IMAGING,
    THORACOSCOPY_DIAGNOSTIC, THORACOSCOPY_PLEURAL_BIOPSY, THORACOSCOPY_PLEURODESIS,
};
use crate::domain::evidence::EvidenceContext;

pub const GROUP_EBUS_LINEAR: &str = "bronchoscopy_ebus_linear";
pub const GROUP_EBUS_RADIAL: &str = "bronchoscopy_ebus_radial";
pub const GROUP_NAVIGATION: &str = "bronchoscopy_navigation";
pub const GROUP_STENT: &str = "airway_stent";
pub const GROUP_DILATION: &str = "airway_dilation";
pub const GROUP_BAL: &str = "bronchoscopy_bal";
pub const GROUP_TBLB: &str = "transbronchial_biopsy";
pub const GROUP_TBNA: &str = "tbna";
pub const GROUP_TUMOR_DESTRUCTION: &str = "tumor_destruction";
pub const GROUP_TUMOR_EXCISION: &str = "tumor_excision";
pub const GROUP_VALVE_PLACEMENT: &str = "valve_placement";
pub const GROUP_VALVE_REMOVAL: &str = "valve_removal";
pub const GROUP_IMAGING_GUIDANCE: &str = "imaging_guidance";

const PERIPHERAL_SAMPLING: [&str; 6] = [
    BRONCH_BRUSHING,
    BRONCH_BAL,
    BRONCH_ENDOBRONCHIAL_BIOPSY,
    BRONCH_FIDUCIAL,
    BRONCH_TBLB,
    BRONCH_TBNA,
];
const EBUS_LINEAR_CODES: [&str; 2] = [EBUS_TBNA_ONE_TWO_STATIONS, EBUS_TBNA_THREE_PLUS_STATIONS];
const STENT_CODES: [&str; 3] =
    [BRONCH_STENT_TRACHEAL, BRONCH_STENT_BRONCHIAL, BRONCH_STENT_ADDITIONAL];
const THORACOSCOPY_PRIORITY: [&str; 3] =
    [THORACOSCOPY_PLEURODESIS, THORACOSCOPY_PLEURAL_BIOPSY, THORACOSCOPY_DIAGNOSTIC];
const DILATION_BUNDLERS: [(&str, &str); 6] = [
    (BRONCH_STENT_TRACHEAL, GROUP_STENT),
    (BRONCH_STENT_BRONCHIAL, GROUP_STENT),
    (BRONCH_STENT_ADDITIONAL, GROUP_STENT),
    (BRONCH_STENT_REVISION, GROUP_STENT),
    (BRONCH_TUMOR_EXCISION, GROUP_TUMOR_EXCISION),
    (BRONCH_TUMOR_DESTRUCTION, GROUP_TUMOR_DESTRUCTION),
];

pub fn native_rules() -> [NativeRule; 18] {
    [
        NativeRule { id: "R001", name: "out_of_domain", apply: out_of_domain },
        NativeRule { id: "R002", name: "ebus_linear_vs_radial", apply: ebus_linear_vs_radial },
        NativeRule { id: "R003", name: "ebus_station_gating", apply: ebus_station_gating },
        NativeRule { id: "R004", name: "radial_ebus_add_on", apply: radial_ebus_add_on },
        NativeRule { id: "R005", name: "navigation", apply: navigation },
        NativeRule { id: "R006", name: "airway_stent", apply: airway_stent },
        NativeRule { id: "R007", name: "bronchoalveolar_lavage", apply: bronchoalveolar_lavage },
        NativeRule {
            id: "R008",
            name: "indwelling_pleural_catheter",
            apply: indwelling_pleural_catheter,
        },
        NativeRule { id: "R009", name: "additional_lobe", apply: additional_lobe },
        NativeRule { id: "R010", name: "therapeutic_aspiration", apply: therapeutic_aspiration },
        NativeRule {
            id: "R011",
            name: "thoracoscopy_site_priority",
            apply: thoracoscopy_site_priority,
        },
        NativeRule { id: "R012", name: "pleural_imaging_pairs", apply: pleural_imaging_pairs },
        NativeRule { id: "R013", name: "diagnostic_bronchoscopy", apply: diagnostic_bronchoscopy },
        NativeRule { id: "R014", name: "brushing", apply: brushing },
        NativeRule { id: "R015", name: "endobronchial_biopsy", apply: endobronchial_biopsy },
        NativeRule {
            id: "R016",
            name: "tumor_destruction_excision",
            apply: tumor_destruction_excision,
        },
        NativeRule { id: "R017", name: "dilation_bundling", apply: dilation_bundling },
        NativeRule { id: "R018", name: "valves", apply: valves },
    ]
}

fn documented(evidence: &EvidenceContext, group: &str, term_category: &str) -> bool {
    evidence.has_group(group) || evidence.has_terms(term_category)
}

fn linear_ebus(evidence: &EvidenceContext) -> bool {
    documented(evidence, GROUP_EBUS_LINEAR, "ebus_linear")
}

fn radial_ebus(evidence: &EvidenceContext) -> bool {
    evidence.radial().performed || documented(evidence, GROUP_EBUS_RADIAL, "ebus_radial")
}

pub fn out_of_domain(context: &RuleContext<'_>, codes: &CodeSet) -> RuleStep {
    let mut step = RuleStep::begin("R001", codes);
    for code in codes {
        if !context.knowledge.is_valid(code) {
            step.discard(code, "not in knowledge base");
        }
    }
    step
}

fn ebus_linear_vs_radial(context: &RuleContext<'_>, codes: &CodeSet) -> RuleStep {
    let evidence = context.evidence;
    let mut step = RuleStep::begin("R002", codes);

    if linear_ebus(evidence) {
        if step.has_any(&EBUS_LINEAR_CODES) {
            return step;
        }
        if !step.upgrade(
            BRONCH_TBNA,
            EBUS_TBNA_ONE_TWO_STATIONS,
            "TBNA performed under linear EBUS guidance",
        ) {
            step.add(EBUS_TBNA_ONE_TWO_STATIONS, "linear EBUS nodal sampling documented");
        }
    } else if radial_ebus(evidence) {
        step.discard_all(
            &EBUS_LINEAR_CODES,
            "only radial EBUS documented; no linear EBUS evidence",
        );
    }
    step
}

fn ebus_station_gating(context: &RuleContext<'_>, codes: &CodeSet) -> RuleStep {
    let evidence = context.evidence;
    let mut step = RuleStep::begin("R003", codes);
    if !step.has_any(&EBUS_LINEAR_CODES) {
        return step;
    }

    let signal = linear_ebus(evidence) || evidence.has_terms("ebus");
    if !signal {
        step.discard_all(&EBUS_LINEAR_CODES, "missing evidence: EBUS signal");
        return step;
    }

    match evidence.ebus_station_count() {
        None | Some(0) => {
            step.discard_all(&EBUS_LINEAR_CODES, "missing evidence: sampled station context");
            step.warn("EBUS-TBNA documented without sampled stations; EBUS codes withheld");
        }
        Some(count) if count >= 3 => {
            let reason = format!("{count} unique stations sampled");
            if !step.upgrade(
                EBUS_TBNA_ONE_TWO_STATIONS,
                EBUS_TBNA_THREE_PLUS_STATIONS,
                reason.as_str(),
            ) {
                step.add(EBUS_TBNA_THREE_PLUS_STATIONS, reason);
            }
        }
        Some(count) => {
            let reason = format!("{count} unique station(s) sampled");
            if !step.upgrade(
                EBUS_TBNA_THREE_PLUS_STATIONS,
                EBUS_TBNA_ONE_TWO_STATIONS,
                reason.as_str(),
            ) {
                step.add(EBUS_TBNA_ONE_TWO_STATIONS, reason);
            }
        }
    }
    step
}

fn radial_ebus_add_on(context: &RuleContext<'_>, codes: &CodeSet) -> RuleStep {
    let mut step = RuleStep::begin("R004", codes);
    let radial = radial_ebus(context.evidence);
    let peripheral = step.has_any(&PERIPHERAL_SAMPLING);

    match (radial, peripheral) {
        (true, true) => {
            step.add(EBUS_RADIAL, "radial EBUS localization with peripheral sampling");
        }
        (false, _) => {
            step.discard(EBUS_RADIAL, "missing evidence: radial EBUS");
        }
        (true, false) => {
            step.discard(EBUS_RADIAL, "missing evidence: peripheral sampling code");
        }
    }
    step
}

fn navigation(context: &RuleContext<'_>, codes: &CodeSet) -> RuleStep {
    let evidence = context.evidence;
    let mut step = RuleStep::begin("R005", codes);
    let nav = evidence.navigation();

    let platform = nav
        .platform
        .as_deref()
        .map(str::trim)
        .filter(|platform| !platform.is_empty())
        .map(str::to_owned)
        .or_else(|| {
            documented(evidence, GROUP_NAVIGATION, "navigation").then(|| "documented".to_owned())
        });
    let aborted = nav.target_reached == Some(false)
        || (evidence.has_terms("navigation_aborted") && !nav.tool_in_lesion);

    match platform {
        None => {
            step.discard(BRONCH_NAVIGATION, "missing evidence: navigation platform");
        }
        Some(_) if aborted => {
            step.discard(BRONCH_NAVIGATION, "navigation aborted before reaching target");
        }
        Some(platform) => {
            step.add(BRONCH_NAVIGATION, format!("navigation platform: {platform}"));
        }
    }
    step
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StentSite {
    Trachea,
    Bronchus,
}

fn stent_sites(evidence: &EvidenceContext) -> Vec<StentSite> {
    let location = evidence.location(GROUP_STENT).unwrap_or_default();
    let mut sites = Vec::new();
    if evidence.has_terms("stent_location_trachea") || location.contains("trache") {
        sites.push(StentSite::Trachea);
    }
    if evidence.has_terms("stent_location_bronchus") || location.contains("bronch") {
        sites.push(StentSite::Bronchus);
    }
    sites
}

fn airway_stent(context: &RuleContext<'_>, codes: &CodeSet) -> RuleStep {
    let evidence = context.evidence;
    let mut step = RuleStep::begin("R006", codes);
    let claimed = step.has_any(&STENT_CODES);
    let grouped = evidence.has_group(GROUP_STENT);
    if !claimed && !grouped {
        return step;
    }

    let sites = stent_sites(evidence);
    let mut missing = Vec::new();
    if !documented(evidence, GROUP_STENT, "stent") {
        missing.push("stent keyword");
    }
    if !evidence.has_terms("stent_placement") {
        missing.push("placement action");
    }
    if sites.is_empty() {
        missing.push("tracheal or bronchial location");
    }
    if evidence.has_terms("stent_negation") {
        missing.push("absence of negation");
    }
    if !missing.is_empty() {
        step.discard_all(&STENT_CODES, &format!("missing evidence: {}", missing.join(", ")));
        return step;
    }

    let tracheal = sites.contains(&StentSite::Trachea);
    let bronchial = sites.contains(&StentSite::Bronchus);
    if tracheal && !bronchial {
        step.upgrade(
            BRONCH_STENT_BRONCHIAL,
            BRONCH_STENT_TRACHEAL,
            "stent documented in the trachea",
        );
    }
    if bronchial && !tracheal {
        step.upgrade(
            BRONCH_STENT_TRACHEAL,
            BRONCH_STENT_BRONCHIAL,
            "stent documented in a bronchus",
        );
    }
    if tracheal {
        step.add(BRONCH_STENT_TRACHEAL, "tracheal stent placement documented");
    }
    if bronchial {
        step.add(BRONCH_STENT_BRONCHIAL, "bronchial stent placement documented");
    }
    step
}

fn bronchoalveolar_lavage(context: &RuleContext<'_>, codes: &CodeSet) -> RuleStep {
    let evidence = context.evidence;
    let mut step = RuleStep::begin("R007", codes);
    if documented(evidence, GROUP_BAL, "bal") {
        return step;
    }
    let reason = if evidence.has_terms("bronchial_wash") {
        "bronchial washings only; washings do not qualify as lavage"
    } else {
        "missing evidence: bronchoalveolar lavage"
    };
    step.discard(BRONCH_BAL, reason);
    step
}

fn indwelling_pleural_catheter(context: &RuleContext<'_>, codes: &CodeSet) -> RuleStep {
    let evidence = context.evidence;
    let mut step = RuleStep::begin("R008", codes);
    let tunneled = evidence.has_terms("tunneled_catheter");
    let placement = evidence.has_terms("catheter_placement");
    let removal = evidence.has_terms("catheter_removal");

    if step.has(PLEURAL_IPC_PLACEMENT) {
        if removal && !placement {
            step.upgrade(
                PLEURAL_IPC_PLACEMENT,
                PLEURAL_IPC_REMOVAL,
                "tunneled catheter removal only",
            );
        } else if !tunneled || !placement {
            let mut missing = Vec::new();
            if !tunneled {
                missing.push("tunneled catheter");
            }
            if !placement {
                missing.push("placement action");
            }
            step.discard(
                PLEURAL_IPC_PLACEMENT,
                format!("missing evidence: {}", missing.join(", ")),
            );
        }
    }
    if step.has(PLEURAL_IPC_REMOVAL) && !removal {
        step.discard(PLEURAL_IPC_REMOVAL, "missing evidence: catheter removal");
    }
    step
}

fn additional_lobe(context: &RuleContext<'_>, codes: &CodeSet) -> RuleStep {
    let evidence = context.evidence;
    let mut step = RuleStep::begin("R009", codes);

    for (base, add_on, group, registry_key) in [
        (BRONCH_TBLB, BRONCH_TBLB_ADDITIONAL_LOBE, GROUP_TBLB, "tblb_lobes"),
        (BRONCH_TBNA, BRONCH_TBNA_ADDITIONAL_LOBE, GROUP_TBNA, "tbna_lobes"),
    ] {
        let lobes = evidence.lobes(group, registry_key);
        if lobes.len() >= 2 {
            if step.has(base) {
                let listed: Vec<&str> = lobes.iter().map(String::as_str).collect();
                let reason =
                    format!("{} distinct lobes sampled: {}", lobes.len(), listed.join(", "));
                step.add(add_on, reason);
            }
        } else {
            step.discard(add_on, "missing evidence: two or more distinct lobes");
        }
    }
    step
}

fn therapeutic_aspiration(context: &RuleContext<'_>, codes: &CodeSet) -> RuleStep {
    let evidence = context.evidence;
    let mut step = RuleStep::begin("R010", codes);
    let codes = [BRONCH_ASPIRATION_INITIAL, BRONCH_ASPIRATION_SUBSEQUENT];
    if !step.has_any(&codes) {
        return step;
    }

    if !evidence.has_terms("therapeutic_aspiration") {
        let reason = if evidence.has_terms("routine_suction") {
            "routine suctioning is not therapeutic aspiration"
        } else {
            "missing evidence: therapeutic aspiration"
        };
        step.discard_all(&codes, reason);
        return step;
    }

    let subsequent = evidence.registry_flag("aspiration_subsequent_episode")
        || evidence.has_terms("aspiration_subsequent");
    if !subsequent {
        step.upgrade(
            BRONCH_ASPIRATION_SUBSEQUENT,
            BRONCH_ASPIRATION_INITIAL,
            "no subsequent aspiration episode documented",
        );
    }
    step
}

fn thoracoscopy_site_priority(_context: &RuleContext<'_>, codes: &CodeSet) -> RuleStep {
    let mut step = RuleStep::begin("R011", codes);
    let Some(winner) = THORACOSCOPY_PRIORITY.iter().find(|code| step.has(code)).copied() else {
        return step;
    };
    for code in THORACOSCOPY_PRIORITY {
        if code != winner {
            step.discard(code, format!("thoracoscopy site priority: {winner} supersedes {code}"));
        }
    }
    step
}

fn pleural_imaging_pairs(context: &RuleContext<'_>, codes: &CodeSet) -> RuleStep {
    let evidence = context.evidence;
    let mut step = RuleStep::begin("R012", codes);
    let imaging = documented(evidence, GROUP_IMAGING_GUIDANCE, "imaging_guidance")
        || evidence.registry_flag("imaging_guided");

    for (blind, guided) in
        [(THORACENTESIS_BLIND, THORACENTESIS_IMAGING), (PLEURAL_DRAIN_BLIND, PLEURAL_DRAIN_IMAGING)]
    {
        if imaging {
            step.upgrade(blind, guided, "imaging guidance documented");
        } else {
            step.upgrade(guided, blind, "missing evidence: imaging guidance");
        }
    }
    step
}

fn diagnostic_bronchoscopy(context: &RuleContext<'_>, codes: &CodeSet) -> RuleStep {
    let mut step = RuleStep::begin("R013", codes);
    let surgical = codes.iter().find(|code| {
        code.starts_with("316")
            && code.as_str() != BRONCH_DIAGNOSTIC
            && !context.knowledge.is_add_on(code)
    });
    if let Some(surgical) = surgical {
        step.discard(
            BRONCH_DIAGNOSTIC,
            format!("diagnostic bronchoscopy is included in surgical bronchoscopy {surgical}"),
        );
    }
    step
}

fn brushing(context: &RuleContext<'_>, codes: &CodeSet) -> RuleStep {
    let mut step = RuleStep::begin("R014", codes);
    if !documented(context.evidence, "bronchoscopy_brushing", "brushing") {
        step.discard(BRONCH_BRUSHING, "missing evidence: brushing");
    }
    step
}

fn endobronchial_biopsy(context: &RuleContext<'_>, codes: &CodeSet) -> RuleStep {
    let mut step = RuleStep::begin("R015", codes);
    if !documented(context.evidence, "endobronchial_biopsy", "endobronchial_biopsy") {
        step.discard(BRONCH_ENDOBRONCHIAL_BIOPSY, "missing evidence: endobronchial biopsy");
    }
    step
}

fn tumor_destruction_excision(context: &RuleContext<'_>, codes: &CodeSet) -> RuleStep {
    let evidence = context.evidence;
    let mut step = RuleStep::begin("R016", codes);
    if !documented(evidence, GROUP_TUMOR_DESTRUCTION, "ablation") {
        step.discard(BRONCH_TUMOR_DESTRUCTION, "missing evidence: ablative modality");
    }
    if !documented(evidence, GROUP_TUMOR_EXCISION, "excision") {
        step.discard(BRONCH_TUMOR_EXCISION, "missing evidence: excision or debulking");
    }
    step
}

fn dilation_bundling(context: &RuleContext<'_>, codes: &CodeSet) -> RuleStep {
    let evidence = context.evidence;
    let mut step = RuleStep::begin("R017", codes);
    if !step.has(BRONCH_DILATION) {
        return step;
    }
    let bundlers: Vec<(&str, &str)> =
        DILATION_BUNDLERS.iter().copied().filter(|(code, _)| step.has(code)).collect();
    let Some((primary, _)) = bundlers.first().copied() else {
        return step;
    };

    let dilation_site = evidence.location(GROUP_DILATION);
    let other_sites: Vec<String> =
        bundlers.iter().filter_map(|(_, group)| evidence.location(group)).collect();
    let distinct = evidence.registry_flag("dilation_distinct_site")
        || match dilation_site {
            Some(site) => !other_sites.is_empty() && other_sites.iter().all(|other| *other != site),
            None => false,
        };

    if distinct {
        step.warn(format!(
            "dilation {BRONCH_DILATION} kept with {primary}: documented at a distinct airway site"
        ));
    } else {
        step.discard(
            BRONCH_DILATION,
            format!("dilation bundled into {primary}: no distinct location documented"),
        );
    }
    step
}

fn valves(context: &RuleContext<'_>, codes: &CodeSet) -> RuleStep {
    let evidence = context.evidence;
    let mut step = RuleStep::begin("R018", codes);

    let placement = documented(evidence, GROUP_VALVE_PLACEMENT, "valve_placement");
    if !placement {
        step.discard_all(
            &[BRONCH_VALVE_INITIAL, BRONCH_VALVE_ADDITIONAL],
            "missing evidence: valve placement",
        );
    } else if step.has(BRONCH_VALVE_INITIAL) {
        let lobes = evidence.lobes(GROUP_VALVE_PLACEMENT, "valve_lobes");
        if lobes.len() >= 2 {
            step.add(BRONCH_VALVE_ADDITIONAL, format!("valves placed in {} lobes", lobes.len()));
        } else {
            step.discard(BRONCH_VALVE_ADDITIONAL, "missing evidence: valves in two or more lobes");
        }
    }

    let removal = documented(evidence, GROUP_VALVE_REMOVAL, "valve_removal");
    if !removal {
        step.discard_all(
            &[BRONCH_VALVE_REMOVAL, BRONCH_VALVE_REMOVAL_ADDITIONAL],
            "missing evidence: valve removal",
        );
    } else if evidence.lobes(GROUP_VALVE_REMOVAL, "valve_removal_lobes").len() < 2 {
        step.discard(
            BRONCH_VALVE_REMOVAL_ADDITIONAL,
            "missing evidence: valves removed from two or more lobes",
        );
    }
    step
}
