//! Built-in entity registrations.
//!
//! Column orders end with the shared tail every pipeline emits: the fallback
//! marker columns, the run metadata columns and the two hash columns.

use std::collections::HashSet;

use regex::Regex;

use crate::ident;

use super::{
    Check, ColumnRule, ColumnType, EntityDescriptor, JsonShape, Predicate, SchemaRegistration,
    SchemaRegistry, SchemaRegistryError, Severity,
};

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static pattern compiles")
}

fn regex_check(name: &str, pattern: &str) -> Check {
    Check::new(name, Predicate::Regex(re(pattern)))
}

/// Columns carried by fallback marker rows.
pub fn fallback_columns() -> Vec<ColumnRule> {
    vec![
        ColumnRule::new("fallback_reason", ColumnType::String).check(
            Check::new(
                "fallback_reason_known",
                Predicate::Membership(
                    ["cache", "network", "timeout", "5xx", "partial"]
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                ),
            )
            .with_severity(Severity::Warning),
        ),
        ColumnRule::new("fallback_error_type", ColumnType::String),
        ColumnRule::new("fallback_http_status", ColumnType::Int).check(
            Check::new(
                "http_status_range",
                Predicate::Range {
                    min: Some(100.0),
                    max: Some(599.0),
                    inclusive: true,
                },
            )
            .with_severity(Severity::Warning),
        ),
        ColumnRule::new("fallback_retry_after_sec", ColumnType::Float),
        ColumnRule::new("fallback_attempt", ColumnType::Int),
        ColumnRule::new("fallback_timestamp", ColumnType::String),
    ]
}

/// Run metadata stamped into every row.
pub fn metadata_columns() -> Vec<ColumnRule> {
    vec![
        ColumnRule::new("run_id", ColumnType::String)
            .required()
            .check(regex_check("run_id_uuid", ident::UUID_PATTERN)),
        ColumnRule::new("pipeline_version", ColumnType::String).required(),
        ColumnRule::new("source_system", ColumnType::String).required(),
        ColumnRule::new("chembl_release", ColumnType::String)
            .check(regex_check("chembl_release_format", ident::CHEMBL_RELEASE_PATTERN)),
        ColumnRule::new("extracted_at", ColumnType::String)
            .required()
            .check(regex_check("extracted_at_iso", ident::ISO_INSTANT_PATTERN)),
    ]
}

pub fn hash_columns() -> Vec<ColumnRule> {
    vec![
        ColumnRule::new("hash_business_key", ColumnType::String)
            .required()
            .check(regex_check("hash_hex", ident::HASH_HEX_PATTERN)),
        ColumnRule::new("hash_row", ColumnType::String)
            .required()
            .check(regex_check("hash_hex", ident::HASH_HEX_PATTERN)),
    ]
}

fn shared_tail() -> Vec<ColumnRule> {
    let mut tail = fallback_columns();
    tail.extend(metadata_columns());
    tail.extend(hash_columns());
    tail
}

fn registration(
    entity_id: &str,
    schema_version: &str,
    business_key_fields: &[&str],
    row_hash_fields: &[&str],
    sort_by: &[&str],
    case_preserving: &[&str],
    mut columns: Vec<ColumnRule>,
) -> SchemaRegistration {
    columns.extend(shared_tail());
    let column_order = columns.iter().map(|c| c.name.clone()).collect();
    SchemaRegistration {
        descriptor: EntityDescriptor {
            entity_id: entity_id.to_string(),
            schema_version: schema_version.to_string(),
            column_order,
            business_key_fields: business_key_fields.iter().map(|s| s.to_string()).collect(),
            row_hash_fields: row_hash_fields.iter().map(|s| s.to_string()).collect(),
        },
        columns,
        case_preserving: case_preserving
            .iter()
            .map(|s| s.to_string())
            .collect::<HashSet<_>>(),
        sort_by: sort_by.iter().map(|s| s.to_string()).collect(),
        ascending: sort_by.iter().map(|_| true).collect(),
    }
}

pub fn activity() -> SchemaRegistration {
    registration(
        "activity",
        "1.0.0",
        &["activity_id"],
        &["activity_id", "standard_type", "standard_value", "standard_units"],
        &["activity_id"],
        &["smiles"],
        vec![
            ColumnRule::new("activity_id", ColumnType::Int)
                .required()
                .check(Check::new("activity_id_unique", Predicate::Unique)),
            ColumnRule::new("assay_chembl_id", ColumnType::String)
                .check(regex_check("assay_chembl_id_format", ident::CHEMBL_ID_PATTERN)),
            ColumnRule::new("compound_id", ColumnType::String)
                .check(regex_check("compound_id_format", ident::CHEMBL_ID_PATTERN)),
            ColumnRule::new("target_chembl_id", ColumnType::String)
                .check(regex_check("target_chembl_id_format", ident::CHEMBL_ID_PATTERN)),
            ColumnRule::new("document_chembl_id", ColumnType::String)
                .check(regex_check("document_chembl_id_format", ident::CHEMBL_ID_PATTERN)),
            ColumnRule::new("standard_type", ColumnType::String),
            ColumnRule::new("standard_relation", ColumnType::String)
                .check(Check::new("standard_relation_known", Predicate::RelationIn)),
            ColumnRule::new("standard_value", ColumnType::Float).check(Check::new(
                "standard_value_nonnegative",
                Predicate::Range {
                    min: Some(0.0),
                    max: None,
                    inclusive: true,
                },
            )),
            ColumnRule::new("standard_units", ColumnType::String),
            ColumnRule::new("pchembl_value", ColumnType::Float).check(
                Check::new(
                    "pchembl_range",
                    Predicate::Range {
                        min: Some(0.0),
                        max: Some(15.0),
                        inclusive: true,
                    },
                )
                .with_severity(Severity::Warning),
            ),
            ColumnRule::new("bao_format", ColumnType::String)
                .check(regex_check("bao_format_id", ident::BAO_PATTERN)),
            ColumnRule::new("data_validity_comment", ColumnType::String),
            ColumnRule::new("smiles", ColumnType::String),
        ],
    )
}

pub fn assay() -> SchemaRegistration {
    registration(
        "assay",
        "1.0.0",
        &["assay_chembl_id"],
        &["assay_chembl_id", "assay_type", "target_chembl_id"],
        &["assay_chembl_id"],
        &[],
        vec![
            ColumnRule::new("assay_chembl_id", ColumnType::String)
                .required()
                .check(regex_check("assay_chembl_id_format", ident::CHEMBL_ID_PATTERN))
                .check(Check::new("assay_chembl_id_unique", Predicate::Unique)),
            ColumnRule::new("assay_type", ColumnType::String).check(Check::new(
                "assay_type_known",
                Predicate::Membership(
                    ["B", "F", "A", "T", "P", "U"]
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                ),
            )),
            ColumnRule::new("description", ColumnType::String),
            ColumnRule::new("assay_organism", ColumnType::String),
            ColumnRule::new("assay_tax_id", ColumnType::Int),
            ColumnRule::new("target_chembl_id", ColumnType::String)
                .check(regex_check("target_chembl_id_format", ident::CHEMBL_ID_PATTERN)),
            ColumnRule::new("document_chembl_id", ColumnType::String)
                .check(regex_check("document_chembl_id_format", ident::CHEMBL_ID_PATTERN)),
            ColumnRule::new("bao_format", ColumnType::String)
                .check(regex_check("bao_format_id", ident::BAO_PATTERN)),
            ColumnRule::new("confidence_score", ColumnType::Int).check(Check::new(
                "confidence_score_range",
                Predicate::Range {
                    min: Some(0.0),
                    max: Some(9.0),
                    inclusive: true,
                },
            )),
        ],
    )
}

pub fn document() -> SchemaRegistration {
    registration(
        "document",
        "1.0.0",
        &["document_chembl_id"],
        &["document_chembl_id", "doi_clean", "pmid", "title"],
        &["document_chembl_id"],
        &[],
        vec![
            ColumnRule::new("document_chembl_id", ColumnType::String)
                .required()
                .check(regex_check("document_chembl_id_format", ident::CHEMBL_ID_PATTERN))
                .check(Check::new("document_chembl_id_unique", Predicate::Unique)),
            ColumnRule::new("doi_clean", ColumnType::String)
                .check(regex_check("doi_format", ident::DOI_PATTERN)),
            ColumnRule::new("pmid", ColumnType::Int),
            ColumnRule::new("title", ColumnType::String),
            ColumnRule::new("title_source", ColumnType::String),
            ColumnRule::new("abstract", ColumnType::String),
            ColumnRule::new("journal", ColumnType::String),
            ColumnRule::new("year", ColumnType::Int).check(
                Check::new(
                    "year_plausible",
                    Predicate::Range {
                        min: Some(1800.0),
                        max: Some(2100.0),
                        inclusive: true,
                    },
                )
                .with_severity(Severity::Warning),
            ),
            ColumnRule::new("volume", ColumnType::String),
            ColumnRule::new("issue", ColumnType::String),
            ColumnRule::new("first_page", ColumnType::String),
            ColumnRule::new("last_page", ColumnType::String),
            ColumnRule::new("authors", ColumnType::Encoded),
            ColumnRule::new("mesh_terms", ColumnType::Encoded),
            ColumnRule::new("chemicals", ColumnType::Encoded),
            ColumnRule::new("title_extras", ColumnType::Encoded)
                .check(Check::new("title_extras_shape", Predicate::JsonArrayOf(JsonShape::Object))),
        ],
    )
}

pub fn target() -> SchemaRegistration {
    registration(
        "target",
        "1.0.0",
        &["target_chembl_id"],
        &["target_chembl_id", "pref_name", "target_type", "organism"],
        &["target_chembl_id"],
        &[],
        vec![
            ColumnRule::new("target_chembl_id", ColumnType::String)
                .required()
                .check(regex_check("target_chembl_id_format", ident::CHEMBL_ID_PATTERN))
                .check(Check::new("target_chembl_id_unique", Predicate::Unique)),
            ColumnRule::new("pref_name", ColumnType::String),
            ColumnRule::new("target_type", ColumnType::String),
            ColumnRule::new("organism", ColumnType::String),
            ColumnRule::new("tax_id", ColumnType::Int),
            ColumnRule::new("uniprot_id", ColumnType::String)
                .check(regex_check("uniprot_accession", ident::UNIPROT_PATTERN)),
            ColumnRule::new("gene_symbol", ColumnType::String),
            ColumnRule::new("iuphar_target_id", ColumnType::Int),
            ColumnRule::new("iuphar_family_id", ColumnType::Int),
            ColumnRule::new("iuphar_family_name", ColumnType::String),
        ],
    )
}

pub fn testitem() -> SchemaRegistration {
    registration(
        "testitem",
        "1.0.0",
        &["molecule_chembl_id"],
        &["molecule_chembl_id", "canonical_smiles", "standard_inchi_key"],
        &["molecule_chembl_id"],
        &["canonical_smiles", "standard_inchi_key", "pubchem_lookup_inchikey"],
        vec![
            ColumnRule::new("molecule_chembl_id", ColumnType::String)
                .required()
                .check(regex_check("molecule_chembl_id_format", ident::CHEMBL_ID_PATTERN))
                .check(Check::new("molecule_chembl_id_unique", Predicate::Unique)),
            ColumnRule::new("pref_name", ColumnType::String),
            ColumnRule::new("canonical_smiles", ColumnType::String),
            ColumnRule::new("standard_inchi_key", ColumnType::String)
                .check(regex_check("inchi_key_format", ident::INCHI_KEY_PATTERN)),
            ColumnRule::new("molecular_formula", ColumnType::String),
            ColumnRule::new("full_mwt", ColumnType::Float).check(Check::new(
                "full_mwt_positive",
                Predicate::Range {
                    min: Some(0.0),
                    max: None,
                    inclusive: false,
                },
            )),
            ColumnRule::new("pubchem_cid", ColumnType::Int),
            ColumnRule::new("pubchem_lookup_inchikey", ColumnType::String),
            ColumnRule::new("pubchem_synonyms", ColumnType::Encoded),
        ],
    )
}

pub fn register_all(registry: &mut SchemaRegistry) -> Result<(), SchemaRegistryError> {
    registry.register(activity())?;
    registry.register(assay())?;
    registry.register(document())?;
    registry.register(target())?;
    registry.register(testitem())?;
    Ok(())
}
