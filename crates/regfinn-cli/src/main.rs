use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use regfinn_client::{HttpClient, HttpClientConfig, MemoFetch};
use regfinn_core::{CollectionRequest, RowFilter};
use regfinn_engine::{run_search, EnrichmentConfig, RuleSet, RunConfig, REGISTRY_ENDPOINT};
use regfinn_export::{build_table, write_csv_file, write_xlsx_file};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Preset municipality names accepted alongside raw codes.
const MUNICIPALITY_PRESETS: [(&str, &str); 7] = [
    ("oslo", "0301"),
    ("bergen", "4601"),
    ("trondheim", "5001"),
    ("stavanger", "1103"),
    ("drammen", "3005"),
    ("baerum", "3024"),
    ("bærum", "3024"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Csv,
    Xlsx,
}

#[derive(Debug, Parser)]
#[command(name = "regfinn")]
#[command(about = "Search the Norwegian business registry and export matching companies")]
struct Cli {
    /// Municipalities to restrict to: preset names (oslo, bergen, ...) or
    /// raw municipality codes, comma separated. Empty means unrestricted.
    #[arg(long, value_delimiter = ',')]
    municipality: Vec<String>,

    /// Minimum employee count; 0 leaves the lower bound unconstrained.
    #[arg(long, default_value_t = 0)]
    min_employees: u32,

    /// Maximum employee count; 0 leaves the upper bound unconstrained.
    #[arg(long, default_value_t = 0)]
    max_employees: u32,

    /// How many companies to collect.
    #[arg(long, default_value_t = 500)]
    quota: usize,

    /// Rows per registry page.
    #[arg(long, default_value_t = 200)]
    page_size: usize,

    /// Segment names to keep, comma separated; empty keeps every segment.
    #[arg(long, value_delimiter = ',')]
    segment: Vec<String>,

    /// Keep only private-sector companies (combine with --public for both).
    #[arg(long)]
    private: bool,

    /// Keep only public-sector companies.
    #[arg(long)]
    public: bool,

    /// Keep only companies with a usable website.
    #[arg(long)]
    require_website: bool,

    /// Shuffle the accepted rows before enrichment and export.
    #[arg(long)]
    shuffle: bool,

    /// Enrich rows with financial figures (best effort).
    #[arg(long)]
    enrich: bool,

    /// Cap on financial lookups when enriching.
    #[arg(long, default_value_t = 500)]
    max_lookups: usize,

    /// YAML rule file overriding the built-in segment/org-form tables.
    #[arg(long)]
    rules: Option<PathBuf>,

    /// Registry endpoint override.
    #[arg(long, default_value = REGISTRY_ENDPOINT)]
    endpoint: String,

    #[arg(long, value_enum, default_value_t = OutputFormat::Csv)]
    format: OutputFormat,

    /// Output path; defaults to companies.csv or companies.xlsx.
    #[arg(long)]
    output: Option<PathBuf>,

    #[arg(long, default_value_t = 30)]
    http_timeout_secs: u64,
}

/// Map preset names to codes and pass raw codes through, de-duplicated in
/// first-seen order.
fn resolve_municipalities(inputs: &[String]) -> Result<Vec<String>> {
    let mut codes = Vec::new();
    for input in inputs {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            continue;
        }
        let lowered = trimmed.to_lowercase();
        let code = MUNICIPALITY_PRESETS
            .iter()
            .find(|(name, _)| *name == lowered)
            .map(|(_, code)| code.to_string());
        let code = match code {
            Some(code) => code,
            None if trimmed.chars().all(|c| c.is_ascii_digit()) => trimmed.to_string(),
            None => bail!(
                "unknown municipality {trimmed:?}; use a preset name or a numeric code"
            ),
        };
        if !codes.contains(&code) {
            codes.push(code);
        }
    }
    Ok(codes)
}

fn build_request(cli: &Cli, rules: &RuleSet) -> Result<CollectionRequest> {
    if cli.quota == 0 {
        bail!("--quota must be at least 1");
    }
    if cli.page_size == 0 {
        bail!("--page-size must be at least 1");
    }

    let known: BTreeSet<&str> = rules.segments.segment_names().collect();
    let mut selected = BTreeSet::new();
    for name in &cli.segment {
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        if !known.contains(name) {
            bail!(
                "unknown segment {name:?}; available: {}",
                known.iter().copied().collect::<Vec<_>>().join(", ")
            );
        }
        selected.insert(name.to_string());
    }

    let mut request = CollectionRequest::new(cli.quota, cli.page_size);
    request.municipality_codes = resolve_municipalities(&cli.municipality)?;
    request.min_employees = (cli.min_employees > 0).then_some(cli.min_employees);
    request.max_employees = (cli.max_employees > 0).then_some(cli.max_employees);
    request.filter = RowFilter {
        require_website: cli.require_website,
        segments: selected,
        include_private: cli.private,
        include_public: cli.public,
    };
    Ok(request)
}

fn output_path(cli: &Cli) -> PathBuf {
    cli.output.clone().unwrap_or_else(|| match cli.format {
        OutputFormat::Csv => PathBuf::from("companies.csv"),
        OutputFormat::Xlsx => PathBuf::from("companies.xlsx"),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "regfinn=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let rules = match &cli.rules {
        Some(path) => RuleSet::from_yaml_file(path)?,
        None => RuleSet::default(),
    };
    let request = build_request(&cli, &rules)?;

    let client = HttpClient::new(HttpClientConfig {
        timeout: Duration::from_secs(cli.http_timeout_secs),
        user_agent: Some(format!("regfinn/{}", env!("CARGO_PKG_VERSION"))),
        ..HttpClientConfig::default()
    })
    .context("building http client")?;
    let fetch = MemoFetch::new(client);

    let mut config = RunConfig::new(request);
    config.endpoint = cli.endpoint.clone();
    config.rules = rules;
    config.shuffle = cli.shuffle;
    if cli.enrich {
        config.enrichment = Some(EnrichmentConfig {
            max_lookups: cli.max_lookups,
            ..EnrichmentConfig::default()
        });
    }

    let outcome = run_search(&fetch, &config)
        .await
        .context("collection run failed")?;

    let table = build_table(&outcome.rows, outcome.facts.as_ref());
    let path = output_path(&cli);
    match cli.format {
        OutputFormat::Csv => write_csv_file(&table, &path)?,
        OutputFormat::Xlsx => write_xlsx_file(&table, &path)?,
    }

    let summary = &outcome.summary;
    println!(
        "search complete: run_id={} collected={} requested={} upstream_total={} enriched={}/{} output={}",
        summary.run_id,
        summary.collected,
        summary.requested,
        summary.total_matches,
        summary.enrichment_hits,
        summary.enrichment_attempted,
        path.display()
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_cli() -> Cli {
        Cli::parse_from(["regfinn"])
    }

    #[test]
    fn presets_and_raw_codes_deduplicate_in_order() {
        let codes = resolve_municipalities(&[
            "Oslo".into(),
            "3005".into(),
            "oslo".into(),
            "Bergen".into(),
        ])
        .unwrap();
        assert_eq!(codes, ["0301", "3005", "4601"]);
    }

    #[test]
    fn unknown_municipality_name_is_rejected() {
        assert!(resolve_municipalities(&["atlantis".into()]).is_err());
    }

    #[test]
    fn zero_employee_bounds_are_unconstrained() {
        let mut cli = base_cli();
        cli.max_employees = 250;
        let request = build_request(&cli, &RuleSet::default()).unwrap();
        assert_eq!(request.min_employees, None);
        assert_eq!(request.max_employees, Some(250));
    }

    #[test]
    fn unknown_segment_is_rejected() {
        let mut cli = base_cli();
        cli.segment = vec!["Shipping".into()];
        assert!(build_request(&cli, &RuleSet::default()).is_err());
    }

    #[test]
    fn selected_segments_reach_the_filter() {
        let mut cli = base_cli();
        cli.segment = vec!["Office".into()];
        cli.require_website = true;
        cli.private = true;
        let request = build_request(&cli, &RuleSet::default()).unwrap();
        assert!(request.filter.require_website);
        assert!(request.filter.include_private);
        assert!(!request.filter.include_public);
        assert!(request.filter.segments.contains("Office"));
    }

    #[test]
    fn output_path_follows_format() {
        let mut cli = base_cli();
        assert_eq!(output_path(&cli), PathBuf::from("companies.csv"));
        cli.format = OutputFormat::Xlsx;
        assert_eq!(output_path(&cli), PathBuf::from("companies.xlsx"));
        cli.output = Some(PathBuf::from("out/run.xlsx"));
        assert_eq!(output_path(&cli), PathBuf::from("out/run.xlsx"));
    }
}
