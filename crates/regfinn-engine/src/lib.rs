//! Registry page decoding, quota-driven collection, and best-effort
//! financial enrichment.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use regfinn_client::{FetchError, JsonFetch};
use regfinn_core::{
    classify, infer_sector, CollectionRequest, CollectionResult, CompanyRow, FinancialFacts,
    SegmentRules,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;
use uuid::Uuid;

pub const CRATE_NAME: &str = "regfinn-engine";

/// Default upstream registry endpoint (Enhetsregisteret).
pub const REGISTRY_ENDPOINT: &str = "https://data.brreg.no/enhetsregisteret/api/enheter";

// ---------------------------------------------------------------------------
// Rule configuration
// ---------------------------------------------------------------------------

/// Active classification configuration: segment prefix table plus the
/// org-form codes treated as public sector.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleSet {
    pub segments: SegmentRules,
    pub public_org_forms: BTreeSet<String>,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            segments: SegmentRules::builtin(),
            public_org_forms: regfinn_core::builtin_public_org_forms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RuleFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    segments: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    public_org_forms: Vec<String>,
}

impl RuleSet {
    /// Load a rule table from YAML. A file may override the segment table,
    /// the public org-form set, or both; omitted sections keep the
    /// built-in defaults.
    pub fn from_yaml_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: RuleFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

        let mut rule_set = Self::default();
        if !file.segments.is_empty() {
            rule_set.segments = SegmentRules {
                segments: file.segments,
            };
        }
        if !file.public_org_forms.is_empty() {
            rule_set.public_org_forms = file
                .public_org_forms
                .into_iter()
                .map(|c| c.to_uppercase())
                .collect();
        }
        Ok(rule_set)
    }
}

// ---------------------------------------------------------------------------
// Registry wire format
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
struct RegistryPage {
    #[serde(rename = "_embedded", default)]
    embedded: EmbeddedEntities,
    #[serde(default)]
    page: Option<PageMeta>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct EmbeddedEntities {
    #[serde(default)]
    enheter: Vec<JsonValue>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageMeta {
    #[serde(default)]
    total_elements: u64,
    #[serde(default = "default_total_pages")]
    total_pages: usize,
}

fn default_total_pages() -> usize {
    1
}

/// One raw registry entity. Every field is optional; absent nested objects
/// are data, not errors.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntity {
    #[serde(default)]
    pub organisasjonsnummer: Option<String>,
    #[serde(default)]
    pub navn: Option<String>,
    #[serde(default)]
    pub hjemmeside: Option<String>,
    #[serde(default)]
    pub antall_ansatte: Option<u32>,
    #[serde(default)]
    pub forretningsadresse: Option<BusinessAddress>,
    #[serde(default)]
    pub organisasjonsform: Option<CodeRef>,
    #[serde(default)]
    pub institusjonell_sektorkode: Option<CodeRef>,
    #[serde(default)]
    pub naeringskode1: Option<CodeRef>,
    #[serde(default)]
    pub naeringskode2: Option<CodeRef>,
    #[serde(default)]
    pub naeringskode3: Option<CodeRef>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BusinessAddress {
    #[serde(default)]
    pub kommune: Option<String>,
    #[serde(default)]
    pub kommunenummer: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CodeRef {
    #[serde(default)]
    pub kode: Option<String>,
}

/// Map one raw entity into a [`CompanyRow`], classifying and inferring the
/// sector with the active rule set. Industry codes keep their
/// primary/secondary/tertiary order with absent codes skipped.
pub fn normalize_entity(entity: &RegistryEntity, rules: &RuleSet) -> CompanyRow {
    let address = entity.forretningsadresse.clone().unwrap_or_default();
    let industry_codes: Vec<String> = [
        &entity.naeringskode1,
        &entity.naeringskode2,
        &entity.naeringskode3,
    ]
    .into_iter()
    .filter_map(|code_ref| code_ref.as_ref().and_then(|c| c.kode.clone()))
    .collect();

    let org_form = entity
        .organisasjonsform
        .as_ref()
        .and_then(|f| f.kode.clone());
    let sector = infer_sector(
        entity
            .institusjonell_sektorkode
            .as_ref()
            .and_then(|s| s.kode.as_deref()),
        org_form.as_deref(),
        &rules.public_org_forms,
    );
    let segments = classify(&industry_codes, &rules.segments);

    CompanyRow {
        org_id: entity.organisasjonsnummer.clone().unwrap_or_default(),
        name: entity.navn.clone().unwrap_or_default(),
        website: entity.hjemmeside.clone(),
        municipality: address.kommune,
        municipality_code: address.kommunenummer,
        employee_count: entity.antall_ansatte,
        org_form,
        industry_codes,
        segments,
        sector,
    }
}

// ---------------------------------------------------------------------------
// Collection engine
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CollectError {
    #[error(transparent)]
    Transport(#[from] FetchError),
    #[error("registry returned http status {status} on page {page}")]
    Status { status: u16, page: usize },
    #[error("registry page {page} was not a JSON document")]
    NotJson { page: usize },
    #[error("decoding registry page {page}: {source}")]
    Decode {
        page: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Quota-driven paginated collector over the registry endpoint.
pub struct Collector<'a> {
    fetch: &'a dyn JsonFetch,
    endpoint: String,
    rules: RuleSet,
}

impl<'a> Collector<'a> {
    pub fn new(fetch: &'a dyn JsonFetch, endpoint: impl Into<String>, rules: RuleSet) -> Self {
        Self {
            fetch,
            endpoint: endpoint.into(),
            rules,
        }
    }

    fn page_params(request: &CollectionRequest, page: usize) -> Vec<(String, String)> {
        let mut params = vec![
            ("page".to_string(), page.to_string()),
            ("size".to_string(), request.page_size.to_string()),
        ];
        if !request.municipality_codes.is_empty() {
            params.push((
                "kommunenummer".to_string(),
                request.municipality_codes.join(","),
            ));
        }
        if let Some(min) = request.min_employees {
            params.push(("fraAntallAnsatte".to_string(), min.to_string()));
        }
        if let Some(max) = request.max_employees {
            params.push(("tilAntallAnsatte".to_string(), max.to_string()));
        }
        params
    }

    /// Fetch pages until the quota is met or the upstream reports no more
    /// pages. Total-match/total-page metadata is latched from the first
    /// page only. Any registry transport failure fails the whole run.
    pub async fn collect(&self, request: &CollectionRequest) -> Result<CollectionResult, CollectError> {
        let mut page = 0usize;
        let mut rows: Vec<CompanyRow> = Vec::new();
        let mut total_elements: Option<u64> = None;
        let mut total_pages: Option<usize> = None;

        while rows.len() < request.quota {
            let params = Self::page_params(request, page);
            let response = self.fetch.get_json(&self.endpoint, &params).await?;
            if !response.status.is_success() {
                return Err(CollectError::Status {
                    status: response.status.as_u16(),
                    page,
                });
            }
            let body = response.body.ok_or(CollectError::NotJson { page })?;
            let decoded: RegistryPage = serde_json::from_value(body)
                .map_err(|source| CollectError::Decode { page, source })?;

            if total_elements.is_none() {
                let meta = decoded.page;
                total_elements = Some(meta.map(|m| m.total_elements).unwrap_or(0));
                total_pages = Some(meta.map(|m| m.total_pages).unwrap_or(1));
            }

            for raw in &decoded.embedded.enheter {
                let entity: RegistryEntity = match serde_json::from_value(raw.clone()) {
                    Ok(entity) => entity,
                    Err(err) => {
                        warn!(page, %err, "skipping undecodable registry record");
                        continue;
                    }
                };
                let row = normalize_entity(&entity, &self.rules);
                if !request.filter.accepts(&row) {
                    continue;
                }
                rows.push(row);
                if rows.len() >= request.quota {
                    break;
                }
            }

            page += 1;
            if page >= total_pages.unwrap_or(1) {
                break;
            }
        }

        let total_matches = total_elements.unwrap_or(rows.len() as u64);
        debug!(
            collected = rows.len(),
            total_matches,
            pages_fetched = page,
            "collection finished"
        );
        Ok(CollectionResult { rows, total_matches })
    }
}

// ---------------------------------------------------------------------------
// Financial enrichment (best effort)
// ---------------------------------------------------------------------------

/// One candidate shape of the secondary financials API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointCandidate {
    pub url: String,
    pub org_param: String,
}

impl EndpointCandidate {
    fn new(url: &str, org_param: &str) -> Self {
        Self {
            url: url.to_string(),
            org_param: org_param.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnrichmentConfig {
    /// Probed in order; the first JSON success wins.
    pub candidates: Vec<EndpointCandidate>,
    pub net_result_hints: Vec<String>,
    pub payroll_hints: Vec<String>,
    /// Only the first this-many rows are probed.
    pub max_lookups: usize,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        // The financials API is in preview and has moved paths over time;
        // probe the known shapes in order.
        Self {
            candidates: vec![
                EndpointCandidate::new(
                    "https://data.brreg.no/regnskapsregisteret/regnskap/api/regnskap",
                    "organisasjonsnummer",
                ),
                EndpointCandidate::new(
                    "https://data.brreg.no/regnskapsregisteret/regnskap/regnskap",
                    "organisasjonsnummer",
                ),
                EndpointCandidate::new(
                    "https://data.brreg.no/regnskapsregisteret/regnskap/v3/regnskap",
                    "organisasjonsnummer",
                ),
                EndpointCandidate::new(
                    "https://data.brreg.no/regnskapsregisteret/regnskap/regnskap",
                    "orgnr",
                ),
            ],
            net_result_hints: [
                "aarsresultat",
                "arsresultat",
                "resultat etter skatt",
                "årsresultat",
            ]
            .iter()
            .map(|h| h.to_string())
            .collect(),
            payroll_hints: ["loennskostnader", "lonnskostnader", "lønnskostnader"]
                .iter()
                .map(|h| h.to_string())
                .collect(),
            max_lookups: 500,
        }
    }
}

/// Flatten an arbitrary JSON document into (dotted-path, scalar) pairs in
/// document order. Arrays contribute their indices as path elements.
pub fn flatten_json(value: &JsonValue) -> Vec<(String, &JsonValue)> {
    let mut pairs = Vec::new();
    flatten_into(value, String::new(), &mut pairs);
    pairs
}

fn flatten_into<'a>(value: &'a JsonValue, path: String, pairs: &mut Vec<(String, &'a JsonValue)>) {
    match value {
        JsonValue::Object(map) => {
            for (key, child) in map {
                flatten_into(child, join_path(&path, key), pairs);
            }
        }
        JsonValue::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                flatten_into(child, join_path(&path, &index.to_string()), pairs);
            }
        }
        scalar => pairs.push((path, scalar)),
    }
}

fn join_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

/// NFKD-decompose, drop combining marks, lowercase.
fn fold_path(path: &str) -> String {
    path.nfkd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Heuristic numeric extraction: the first number whose folded key path
/// contains any hint. Expected to occasionally miss; the secondary source
/// has no stable schema.
pub fn find_numeric(payload: &JsonValue, hints: &[String]) -> Option<f64> {
    let hints: Vec<String> = hints.iter().map(|h| h.to_lowercase()).collect();
    for (path, value) in flatten_json(payload) {
        let Some(number) = value.as_f64() else {
            continue;
        };
        let folded = fold_path(&path);
        if hints.iter().any(|hint| folded.contains(hint.as_str())) {
            return Some(number);
        }
    }
    None
}

async fn fetch_financial_payload(
    fetch: &dyn JsonFetch,
    config: &EnrichmentConfig,
    org_id: &str,
) -> Option<JsonValue> {
    for candidate in &config.candidates {
        let params = vec![(candidate.org_param.clone(), org_id.to_string())];
        match fetch.get_json(&candidate.url, &params).await {
            Ok(response) if response.is_json_success() => {
                if let Some(body) = response.body {
                    return Some(body);
                }
            }
            Ok(response) => {
                debug!(org_id, url = %candidate.url, status = %response.status, "financials candidate miss");
            }
            Err(err) => {
                debug!(org_id, url = %candidate.url, %err, "financials candidate unreachable");
            }
        }
    }
    None
}

/// Probe the secondary source for the first `max_lookups` rows, in order.
/// The returned map holds one entry per probed row; a probed row with no
/// usable payload gets both-null facts. Rows beyond the cap are absent.
pub async fn enrich(
    fetch: &dyn JsonFetch,
    rows: &[CompanyRow],
    config: &EnrichmentConfig,
) -> BTreeMap<String, FinancialFacts> {
    let mut facts = BTreeMap::new();
    for row in rows.iter().take(config.max_lookups) {
        let payload = fetch_financial_payload(fetch, config, &row.org_id).await;
        let entry = match payload {
            Some(payload) => FinancialFacts {
                net_result: find_numeric(&payload, &config.net_result_hints),
                payroll_cost: find_numeric(&payload, &config.payroll_hints),
            },
            None => FinancialFacts::default(),
        };
        facts.insert(row.org_id.clone(), entry);
    }
    facts
}

// ---------------------------------------------------------------------------
// Run orchestration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub endpoint: String,
    pub rules: RuleSet,
    pub request: CollectionRequest,
    /// Shuffle accepted rows once after collection, before enrichment and
    /// export. Post-processing only; the collection order is unaffected.
    pub shuffle: bool,
    pub enrichment: Option<EnrichmentConfig>,
}

impl RunConfig {
    pub fn new(request: CollectionRequest) -> Self {
        Self {
            endpoint: REGISTRY_ENDPOINT.to_string(),
            rules: RuleSet::default(),
            request,
            shuffle: false,
            enrichment: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub requested: usize,
    pub collected: usize,
    pub total_matches: u64,
    pub enrichment_attempted: usize,
    pub enrichment_hits: usize,
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub rows: Vec<CompanyRow>,
    pub total_matches: u64,
    /// Present iff enrichment ran, keyed by org id.
    pub facts: Option<BTreeMap<String, FinancialFacts>>,
    pub summary: RunSummary,
}

/// One full run: collect until quota, then optionally enrich.
pub async fn run_search(
    fetch: &dyn JsonFetch,
    config: &RunConfig,
) -> Result<SearchOutcome, CollectError> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();

    let collector = Collector::new(fetch, config.endpoint.clone(), config.rules.clone());
    let CollectionResult {
        mut rows,
        total_matches,
    } = collector.collect(&config.request).await?;

    if config.shuffle {
        rows.shuffle(&mut rand::thread_rng());
    }

    let facts = match &config.enrichment {
        Some(enrichment) => Some(enrich(fetch, &rows, enrichment).await),
        None => None,
    };

    let enrichment_attempted = facts.as_ref().map(BTreeMap::len).unwrap_or(0);
    let enrichment_hits = facts
        .as_ref()
        .map(|map| {
            map.values()
                .filter(|f| f.net_result.is_some() || f.payroll_cost.is_some())
                .count()
        })
        .unwrap_or(0);

    let summary = RunSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        requested: config.request.quota,
        collected: rows.len(),
        total_matches,
        enrichment_attempted,
        enrichment_hits,
    };

    Ok(SearchOutcome {
        rows,
        total_matches,
        facts,
        summary,
    })
}
