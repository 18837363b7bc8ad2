//! CPT code constants for the interventional-pulmonology families the engine
//! reasons about, plus notation helpers.
//!
//! Codes are stored and compared without the `+` add-on marker. The marker is
//! only reattached for display.

pub const BRONCH_DIAGNOSTIC: &str = "31622";
pub const BRONCH_BRUSHING: &str = "31623";
pub const BRONCH_BAL: &str = "31624";
pub const BRONCH_ENDOBRONCHIAL_BIOPSY: &str = "31625";
pub const BRONCH_FIDUCIAL: &str = "31626";
pub const BRONCH_NAVIGATION: &str = "31627";
pub const BRONCH_TBLB: &str = "31628";
pub const BRONCH_TBNA: &str = "31629";
pub const BRONCH_DILATION: &str = "31630";
pub const BRONCH_STENT_TRACHEAL: &str = "31631";
pub const BRONCH_TBLB_ADDITIONAL_LOBE: &str = "31632";
pub const BRONCH_TBNA_ADDITIONAL_LOBE: &str = "31633";
pub const BRONCH_STENT_BRONCHIAL: &str = "31636";
pub const BRONCH_STENT_ADDITIONAL: &str = "31637";
pub const BRONCH_STENT_REVISION: &str = "31638";
pub const BRONCH_TUMOR_EXCISION: &str = "31640";
pub const BRONCH_TUMOR_DESTRUCTION: &str = "31641";
pub const BRONCH_ASPIRATION_INITIAL: &str = "31645";
pub const BRONCH_ASPIRATION_SUBSEQUENT: &str = "31646";
pub const BRONCH_VALVE_INITIAL: &str = "31647";
pub const BRONCH_VALVE_REMOVAL: &str = "31648";
pub const BRONCH_VALVE_REMOVAL_ADDITIONAL: &str = "31649";
pub const BRONCH_VALVE_ADDITIONAL: &str = "31651";
pub const EBUS_TBNA_ONE_TWO_STATIONS: &str = "31652";
pub const EBUS_TBNA_THREE_PLUS_STATIONS: &str = "31653";
pub const EBUS_RADIAL: &str = "31654";
pub const BRONCH_THERMOPLASTY_ONE_LOBE: &str = "31660";
pub const BRONCH_THERMOPLASTY_TWO_PLUS_LOBES: &str = "31661";
pub const PLEURAL_IPC_PLACEMENT: &str = "32550";
pub const PLEURAL_IPC_REMOVAL: &str = "32552";
pub const THORACENTESIS_BLIND: &str = "32554";
pub const THORACENTESIS_IMAGING: &str = "32555";
pub const PLEURAL_DRAIN_BLIND: &str = "32556";
pub const PLEURAL_DRAIN_IMAGING: &str = "32557";
pub const PLEURODESIS_INSTILLATION: &str = "32560";
pub const THORACOSCOPY_DIAGNOSTIC: &str = "32601";
pub const THORACOSCOPY_PLEURAL_BIOPSY: &str = "32609";
pub const THORACOSCOPY_PLEURODESIS: &str = "32650";

/// Strips the `+` add-on marker and surrounding whitespace.
pub fn normalize_code(raw: &str) -> String {
    raw.trim().trim_start_matches('+').trim().to_string()
}

/// True when the raw notation carries the `+` add-on marker.
pub fn has_add_on_marker(raw: &str) -> bool {
    raw.trim_start().starts_with('+')
}

/// Four digits followed by a digit or an uppercase letter (`31622`, `0545T`).
pub fn is_well_formed(code: &str) -> bool {
    let bytes = code.as_bytes();
    bytes.len() == 5
        && bytes[..4].iter().all(u8::is_ascii_digit)
        && (bytes[4].is_ascii_digit() || bytes[4].is_ascii_uppercase())
}

pub fn display_code(code: &str, add_on: bool) -> String {
    if add_on {
        format!("+{code}")
    } else {
        code.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::{display_code, has_add_on_marker, is_well_formed, normalize_code};

    #[test]
    fn normalization_strips_marker_and_whitespace() {
        assert_eq!(normalize_code(" +31654 "), "31654");
        assert_eq!(normalize_code("31622"), "31622");
        assert!(has_add_on_marker(" +31627"));
        assert!(!has_add_on_marker("31627"));
    }

    #[test]
    fn well_formed_codes_accept_category_three_suffix() {
        assert!(is_well_formed("31652"));
        assert!(is_well_formed("0545T"));
        assert!(!is_well_formed("3165"));
        assert!(!is_well_formed("+31654"));
        assert!(!is_well_formed("3165a"));
    }

    #[test]
    fn display_reattaches_marker_for_add_ons() {
        assert_eq!(display_code("31654", true), "+31654");
        assert_eq!(display_code("31652", false), "31652");
    }
}
