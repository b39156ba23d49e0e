//! Tabular export of collected rows: report-table building plus CSV and
//! XLSX writers. Row order and header labels are preserved exactly.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use regfinn_core::{CompanyRow, FinancialFacts};
use rust_xlsxwriter::Workbook;

pub const CRATE_NAME: &str = "regfinn-export";

pub const SHEET_NAME: &str = "Companies";

const BASE_HEADERS: [&str; 6] = [
    "Company name",
    "Website",
    "Municipality",
    "Employees",
    "Segment",
    "Sector",
];
const ENRICHMENT_HEADERS: [&str; 2] = ["Net result", "Payroll per employee"];

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Text(String),
    Number(f64),
    Empty,
}

impl Cell {
    fn text(value: Option<&str>) -> Self {
        match value {
            Some(v) => Cell::Text(v.to_string()),
            None => Cell::Empty,
        }
    }

    fn number(value: Option<f64>) -> Self {
        match value {
            Some(v) => Cell::Number(v),
            None => Cell::Empty,
        }
    }

    pub fn as_text(&self) -> String {
        match self {
            Cell::Text(v) => v.clone(),
            Cell::Number(v) => format!("{v}"),
            Cell::Empty => String::new(),
        }
    }
}

/// The produced table. Enrichment columns are present iff a facts map was
/// supplied; a probed-but-missed row and an unprobed row both render blank.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

pub fn build_table(
    rows: &[CompanyRow],
    facts: Option<&BTreeMap<String, FinancialFacts>>,
) -> ReportTable {
    let mut headers: Vec<String> = BASE_HEADERS.iter().map(|h| h.to_string()).collect();
    if facts.is_some() {
        headers.extend(ENRICHMENT_HEADERS.iter().map(|h| h.to_string()));
    }

    let table_rows = rows
        .iter()
        .map(|row| {
            let mut cells = vec![
                Cell::Text(row.name.clone()),
                Cell::text(row.website.as_deref()),
                Cell::text(row.municipality.as_deref()),
                Cell::number(row.employee_count.map(f64::from)),
                Cell::Text(row.segment_label()),
                Cell::Text(row.sector.to_string()),
            ];
            if let Some(facts) = facts {
                let entry = facts.get(&row.org_id).copied().unwrap_or_default();
                cells.push(Cell::number(entry.net_result));
                cells.push(Cell::number(entry.payroll_per_employee(row.employee_count)));
            }
            cells
        })
        .collect();

    ReportTable {
        headers,
        rows: table_rows,
    }
}

pub fn write_csv<W: Write>(table: &ReportTable, writer: W) -> Result<()> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    csv_writer
        .write_record(&table.headers)
        .context("writing csv header")?;
    for row in &table.rows {
        let record: Vec<String> = row.iter().map(Cell::as_text).collect();
        csv_writer.write_record(&record).context("writing csv row")?;
    }
    csv_writer.flush().context("flushing csv output")?;
    Ok(())
}

pub fn csv_bytes(table: &ReportTable) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    write_csv(table, &mut buffer)?;
    Ok(buffer)
}

pub fn write_csv_file(table: &ReportTable, path: &Path) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("creating {}", path.display()))?;
    write_csv(table, file).with_context(|| format!("writing {}", path.display()))
}

pub fn write_xlsx_file(table: &ReportTable, path: &Path) -> Result<()> {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name(SHEET_NAME).context("naming worksheet")?;

    for (col, header) in table.headers.iter().enumerate() {
        sheet
            .write_string(0, col as u16, header)
            .context("writing xlsx header")?;
    }
    for (row_index, row) in table.rows.iter().enumerate() {
        let sheet_row = (row_index + 1) as u32;
        for (col, cell) in row.iter().enumerate() {
            let col = col as u16;
            match cell {
                Cell::Text(v) => {
                    sheet
                        .write_string(sheet_row, col, v)
                        .context("writing xlsx cell")?;
                }
                Cell::Number(v) => {
                    sheet
                        .write_number(sheet_row, col, *v)
                        .context("writing xlsx cell")?;
                }
                Cell::Empty => {}
            }
        }
    }

    workbook
        .save(path)
        .with_context(|| format!("saving {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use regfinn_core::Sector;

    fn row(org_id: &str, name: &str, employees: Option<u32>) -> CompanyRow {
        CompanyRow {
            org_id: org_id.into(),
            name: name.into(),
            website: Some("example.com".into()),
            municipality: Some("Bergen".into()),
            municipality_code: Some("4601".into()),
            employee_count: employees,
            org_form: Some("AS".into()),
            industry_codes: vec!["62.010".into()],
            segments: ["Office".to_string()].into_iter().collect(),
            sector: Sector::Private,
        }
    }

    #[test]
    fn enrichment_columns_appear_only_when_facts_supplied() {
        let rows = vec![row("900000001", "A", Some(10))];
        assert_eq!(build_table(&rows, None).headers.len(), 6);

        let facts = BTreeMap::new();
        let table = build_table(&rows, Some(&facts));
        assert_eq!(table.headers.len(), 8);
        assert_eq!(table.headers[6], "Net result");
        assert_eq!(table.headers[7], "Payroll per employee");
    }

    #[test]
    fn unprobed_and_missed_rows_render_blank_facts() {
        let rows = vec![row("900000001", "A", Some(10)), row("900000002", "B", Some(10))];
        let facts: BTreeMap<String, FinancialFacts> =
            [("900000001".to_string(), FinancialFacts::default())]
                .into_iter()
                .collect();
        let table = build_table(&rows, Some(&facts));

        assert_eq!(table.rows[0][6], Cell::Empty);
        assert_eq!(table.rows[0][7], Cell::Empty);
        assert_eq!(table.rows[1][6], Cell::Empty);
        assert_eq!(table.rows[1][7], Cell::Empty);
    }

    #[test]
    fn payroll_per_employee_is_derived_into_the_table() {
        let rows = vec![row("900000001", "A", Some(10)), row("900000002", "B", Some(0))];
        let known = FinancialFacts {
            net_result: Some(-1_000.0),
            payroll_cost: Some(500_000.0),
        };
        let facts: BTreeMap<String, FinancialFacts> = [
            ("900000001".to_string(), known),
            ("900000002".to_string(), known),
        ]
        .into_iter()
        .collect();
        let table = build_table(&rows, Some(&facts));

        assert_eq!(table.rows[0][6], Cell::Number(-1_000.0));
        assert_eq!(table.rows[0][7], Cell::Number(50_000.0));
        // Zero headcount leaves the derived metric blank.
        assert_eq!(table.rows[1][7], Cell::Empty);
    }

    #[test]
    fn csv_output_preserves_order_and_headers() {
        let rows = vec![row("900000002", "Bravo", Some(5)), row("900000001", "Alpha", None)];
        let table = build_table(&rows, None);
        let text = String::from_utf8(csv_bytes(&table).unwrap()).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(
            lines[0],
            "Company name,Website,Municipality,Employees,Segment,Sector"
        );
        assert_eq!(lines[1], "Bravo,example.com,Bergen,5,Office,Private");
        assert_eq!(lines[2], "Alpha,example.com,Bergen,,Office,Private");
    }

    #[test]
    fn xlsx_file_is_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("companies.xlsx");
        let table = build_table(&[row("900000001", "A", Some(10))], None);

        write_xlsx_file(&table, &path).unwrap();
        assert!(path.exists());
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }
}
