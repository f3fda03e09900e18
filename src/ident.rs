//! Identifier patterns and normalization shared by adapters and schemas.
//!
//! DOIs normalize to lowercase; ChEMBL, UniProt and InChIKey identifiers to
//! uppercase; PMIDs and PubChem CIDs stay numeric text. ORCIDs lose their URL
//! prefix and OpenAlex ids reduce to their short form.

use std::sync::OnceLock;

use regex::Regex;

pub const DOI_PATTERN: &str = r"^10\.\d{4,}/.+$";
pub const PMID_PATTERN: &str = r"^\d+$";
pub const CHEMBL_ID_PATTERN: &str = r"^CHEMBL\d+$";
pub const UNIPROT_PATTERN: &str = r"^[A-Z0-9]{5}[0-9](?:-[0-9]+)?$";
pub const INCHI_KEY_PATTERN: &str = r"^[A-Z]{14}-[A-Z]{10}-[A-Z]$";
pub const ORCID_PATTERN: &str = r"^\d{4}-\d{4}-\d{4}-\d{3}[0-9X]$";
pub const OPENALEX_PATTERN: &str = r"^[WASICF]\d+$";
pub const BAO_PATTERN: &str = r"^BAO_\d{7}$";
pub const HASH_HEX_PATTERN: &str = r"^[0-9a-f]{64}$";
pub const CHEMBL_RELEASE_PATTERN: &str = r"^(?:ChEMBL_)?\d{2}$";
pub const UUID_PATTERN: &str =
    r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$";
pub const ISO_INSTANT_PATTERN: &str = r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}Z$";

fn regex(pattern: &'static str, slot: &'static OnceLock<Regex>) -> &'static Regex {
    slot.get_or_init(|| Regex::new(pattern).expect("static pattern compiles"))
}

macro_rules! static_regex {
    ($name:ident, $pattern:expr) => {
        fn $name() -> &'static Regex {
            static SLOT: OnceLock<Regex> = OnceLock::new();
            regex($pattern, &SLOT)
        }
    };
}

static_regex!(doi_re, DOI_PATTERN);
static_regex!(pmid_re, PMID_PATTERN);
static_regex!(chembl_re, CHEMBL_ID_PATTERN);
static_regex!(uniprot_re, UNIPROT_PATTERN);
static_regex!(inchi_key_re, INCHI_KEY_PATTERN);
static_regex!(orcid_re, ORCID_PATTERN);
static_regex!(openalex_re, OPENALEX_PATTERN);

/// Normalize a DOI: trim, strip resolver prefixes, lowercase. Returns `None`
/// when the remainder is not a DOI.
pub fn normalize_doi(value: &str) -> Option<String> {
    let mut text = value.trim();
    for prefix in [
        "https://doi.org/",
        "http://doi.org/",
        "https://dx.doi.org/",
        "http://dx.doi.org/",
        "doi:",
    ] {
        if let Some(stripped) = strip_prefix_ci(text, prefix) {
            text = stripped;
            break;
        }
    }
    let lowered = text.to_lowercase();
    doi_re().is_match(&lowered).then_some(lowered)
}

fn strip_prefix_ci<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    match text.get(..prefix.len()) {
        Some(head) if head.eq_ignore_ascii_case(prefix) => Some(&text[prefix.len()..]),
        _ => None,
    }
}

pub fn normalize_pmid(value: &str) -> Option<String> {
    let text = value.trim();
    pmid_re().is_match(text).then(|| text.to_string())
}

pub fn normalize_chembl_id(value: &str) -> Option<String> {
    let upper = value.trim().to_uppercase();
    chembl_re().is_match(&upper).then_some(upper)
}

pub fn normalize_uniprot(value: &str) -> Option<String> {
    let upper = value.trim().to_uppercase();
    uniprot_re().is_match(&upper).then_some(upper)
}

pub fn normalize_inchi_key(value: &str) -> Option<String> {
    let upper = value.trim().to_uppercase();
    inchi_key_re().is_match(&upper).then_some(upper)
}

pub fn normalize_orcid(value: &str) -> Option<String> {
    let stripped = value
        .trim()
        .trim_start_matches("https://orcid.org/")
        .trim_start_matches("http://orcid.org/")
        .to_uppercase();
    orcid_re().is_match(&stripped).then_some(stripped)
}

/// Extract the short OpenAlex id from a canonical URL, or accept an already
/// short id.
pub fn normalize_openalex_id(value: &str) -> Option<String> {
    let text = value.trim();
    if let Some(rest) = text
        .strip_prefix("https://openalex.org/")
        .or_else(|| text.strip_prefix("http://openalex.org/"))
    {
        let candidate = rest.to_uppercase();
        return openalex_re().is_match(&candidate).then_some(candidate);
    }
    let candidate = text.to_uppercase();
    openalex_re().is_match(&candidate).then_some(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doi_lowercased_and_deprefixed() {
        assert_eq!(
            normalize_doi("https://doi.org/10.1021/JM00178A015"),
            Some("10.1021/jm00178a015".to_string())
        );
        assert_eq!(
            normalize_doi("doi:10.1000/xyz "),
            Some("10.1000/xyz".to_string())
        );
        assert_eq!(normalize_doi("not-a-doi"), None);
    }

    #[test]
    fn test_chembl_uppercased() {
        assert_eq!(
            normalize_chembl_id(" chembl25 "),
            Some("CHEMBL25".to_string())
        );
        assert_eq!(normalize_chembl_id("CHEMBLX"), None);
    }

    #[test]
    fn test_uniprot_accession() {
        assert_eq!(normalize_uniprot("p12345"), Some("P12345".to_string()));
        assert_eq!(normalize_uniprot("P12345-2"), Some("P12345-2".to_string()));
        assert_eq!(normalize_uniprot("12345"), None);
    }

    #[test]
    fn test_inchi_key() {
        assert_eq!(
            normalize_inchi_key("bsyNrymupcihmv-uhfffaoysa-n"),
            Some("BSYNRYMUPCIHMV-UHFFFAOYSA-N".to_string())
        );
        assert_eq!(normalize_inchi_key("SHORT-KEY"), None);
    }

    #[test]
    fn test_openalex_short_id() {
        assert_eq!(
            normalize_openalex_id("https://openalex.org/W2741809807"),
            Some("W2741809807".to_string())
        );
        assert_eq!(
            normalize_openalex_id("W2741809807"),
            Some("W2741809807".to_string())
        );
        assert_eq!(normalize_openalex_id("https://openalex.org/"), None);
    }

    #[test]
    fn test_orcid_url_prefix_stripped() {
        assert_eq!(
            normalize_orcid("https://orcid.org/0000-0002-1825-009x"),
            Some("0000-0002-1825-009X".to_string())
        );
        assert_eq!(normalize_orcid("12-34"), None);
    }
}
