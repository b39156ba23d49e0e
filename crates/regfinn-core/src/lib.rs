//! Core domain model and pure classification/filter logic for regfinn.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "regfinn-core";

/// Label used when no segment rule matches a company's industry codes.
pub const UNCLASSIFIED_SEGMENT_LABEL: &str = "Other";

/// Private vs public classification of an organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sector {
    Private,
    Public,
}

impl fmt::Display for Sector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sector::Private => f.write_str("Private"),
            Sector::Public => f.write_str("Public"),
        }
    }
}

/// Swappable segment rule table: segment name -> industry-code prefixes.
///
/// A segment with an empty prefix list matches every record. The map is
/// ordered so classification output and display labels are deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRules {
    pub segments: BTreeMap<String, Vec<String>>,
}

impl SegmentRules {
    /// Built-in NACE prefix clusters for the Norwegian registry.
    pub fn builtin() -> Self {
        let mut segments = BTreeMap::new();
        segments.insert(
            "Office".to_string(),
            ["62", "63", "69", "70", "71", "73", "74", "78", "82", "46", "47"]
                .iter()
                .map(|p| p.to_string())
                .collect(),
        );
        segments.insert(
            "Health & care".to_string(),
            ["85", "86", "87", "88"].iter().map(|p| p.to_string()).collect(),
        );
        Self { segments }
    }

    pub fn segment_names(&self) -> impl Iterator<Item = &str> {
        self.segments.keys().map(String::as_str)
    }
}

/// Organizational-form codes treated as public-sector when the institutional
/// sector code is absent. Matched case-insensitively.
pub fn builtin_public_org_forms() -> BTreeSet<String> {
    ["KOMM", "FYLKE", "KF", "FKF", "IKS", "STAT", "SF", "ORGL"]
        .iter()
        .map(|c| c.to_string())
        .collect()
}

/// Multi-label classification of industry codes against a rule table.
///
/// A segment matches when any code starts with any of its prefixes; a
/// segment with no prefixes always matches. Order of `codes` is irrelevant.
pub fn classify(codes: &[String], rules: &SegmentRules) -> BTreeSet<String> {
    rules
        .segments
        .iter()
        .filter(|(_, prefixes)| {
            prefixes.is_empty()
                || codes
                    .iter()
                    .any(|code| prefixes.iter().any(|prefix| code.starts_with(prefix)))
        })
        .map(|(name, _)| name.clone())
        .collect()
}

/// Display label for a classified segment set: the joined segment names, or
/// a fixed fallback when nothing matched.
pub fn segment_label(segments: &BTreeSet<String>) -> String {
    if segments.is_empty() {
        UNCLASSIFIED_SEGMENT_LABEL.to_string()
    } else {
        segments.iter().cloned().collect::<Vec<_>>().join(" + ")
    }
}

/// Sector inference: institutional-sector code starting with `6` wins, then
/// membership of the public org-form set, else private.
pub fn infer_sector(
    institutional_sector_code: Option<&str>,
    org_form_code: Option<&str>,
    public_org_forms: &BTreeSet<String>,
) -> Sector {
    if let Some(code) = institutional_sector_code {
        if code.starts_with('6') {
            return Sector::Public;
        }
    }
    if let Some(form) = org_form_code {
        if public_org_forms.contains(&form.to_uppercase()) {
            return Sector::Public;
        }
    }
    Sector::Private
}

/// One normalized company row, constructed once per accepted registry record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyRow {
    pub org_id: String,
    pub name: String,
    pub website: Option<String>,
    pub municipality: Option<String>,
    pub municipality_code: Option<String>,
    pub employee_count: Option<u32>,
    pub org_form: Option<String>,
    /// Primary/secondary/tertiary industry codes, absent codes skipped.
    pub industry_codes: Vec<String>,
    pub segments: BTreeSet<String>,
    pub sector: Sector,
}

impl CompanyRow {
    pub fn segment_label(&self) -> String {
        segment_label(&self.segments)
    }
}

/// Best-effort financial figures attached to a row after collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FinancialFacts {
    pub net_result: Option<f64>,
    pub payroll_cost: Option<f64>,
}

impl FinancialFacts {
    /// Payroll cost divided by headcount; defined only when both are known
    /// and the headcount is positive.
    pub fn payroll_per_employee(&self, employee_count: Option<u32>) -> Option<f64> {
        match (self.payroll_cost, employee_count) {
            (Some(cost), Some(count)) if count > 0 => Some(cost / f64::from(count)),
            _ => None,
        }
    }
}

/// Website-presence heuristic. Rejects null, blank, and placeholder-short
/// strings (trimmed length must exceed 3).
pub fn has_usable_website(website: Option<&str>) -> bool {
    match website {
        Some(url) => url.trim().len() > 3,
        None => false,
    }
}

/// Local row filter: three independent predicates, each with an explicit
/// disabled state, combined by AND.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowFilter {
    pub require_website: bool,
    /// Selected segment names; empty means the segment filter is disabled.
    pub segments: BTreeSet<String>,
    pub include_private: bool,
    pub include_public: bool,
}

impl RowFilter {
    pub fn accepts(&self, row: &CompanyRow) -> bool {
        self.passes_website(row) && self.passes_segments(row) && self.passes_sector(row)
    }

    fn passes_website(&self, row: &CompanyRow) -> bool {
        !self.require_website || has_usable_website(row.website.as_deref())
    }

    fn passes_segments(&self, row: &CompanyRow) -> bool {
        if self.segments.is_empty() {
            return true;
        }
        row.segments.iter().any(|s| self.segments.contains(s))
    }

    fn passes_sector(&self, row: &CompanyRow) -> bool {
        // Both or neither flag set means the sector filter is off.
        if self.include_private == self.include_public {
            return true;
        }
        match row.sector {
            Sector::Private => self.include_private,
            Sector::Public => self.include_public,
        }
    }
}

/// Immutable description of one collection run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRequest {
    /// Server-side municipality restriction; empty means unrestricted.
    pub municipality_codes: Vec<String>,
    /// Server-side employee-count range; `None` ends are unconstrained.
    pub min_employees: Option<u32>,
    pub max_employees: Option<u32>,
    /// Caller-requested maximum number of accepted rows.
    pub quota: usize,
    pub page_size: usize,
    pub filter: RowFilter,
}

impl CollectionRequest {
    pub fn new(quota: usize, page_size: usize) -> Self {
        Self {
            municipality_codes: Vec::new(),
            min_employees: None,
            max_employees: None,
            quota,
            page_size,
            filter: RowFilter::default(),
        }
    }
}

/// Terminal artifact of one collection run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionResult {
    /// Accepted rows in encounter order, at most `quota` of them.
    pub rows: Vec<CompanyRow>,
    /// Upstream-reported total for the server-side query, independent of
    /// local filtering.
    pub total_matches: u64,
}
