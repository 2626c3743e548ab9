//! Output formatting for CLI

use serde::Serialize;
use std::collections::BTreeMap;
use tabled::{Table, Tabled};

/// Output format options
pub enum OutputFormat {
    Text,
    Json,
    Table,
}

impl From<&str> for OutputFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            "table" => OutputFormat::Table,
            _ => OutputFormat::Text,
        }
    }
}

/// Outcome of a replayed session
#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub impression_id: String,
    pub steps: usize,
    pub elapsed_ms: u64,
    pub final_state: String,
    pub dispatch_state: String,
    /// Delivered payloads per sample state
    pub delivered: BTreeMap<String, usize>,
    pub failed: usize,
}

impl SimulationReport {
    pub fn total_delivered(&self) -> usize {
        self.delivered.values().sum()
    }
}

#[derive(Tabled)]
struct StateRow {
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Samples")]
    samples: usize,
}

/// Render a report in the selected format
pub fn format_report(report: &SimulationReport, format: &str) -> String {
    match OutputFormat::from(format) {
        OutputFormat::Json => {
            serde_json::to_string_pretty(report).unwrap_or_else(|_| "{}".to_string())
        }
        OutputFormat::Table => {
            let rows: Vec<StateRow> = report
                .delivered
                .iter()
                .map(|(state, samples)| StateRow {
                    state: state.clone(),
                    samples: *samples,
                })
                .collect();
            format!(
                "{}\nImpression {} | {} delivered, {} failed",
                Table::new(rows),
                report.impression_id,
                report.total_delivered(),
                report.failed
            )
        }
        OutputFormat::Text => {
            let mut out = String::new();
            out.push_str("\nSimulation Report:\n");
            out.push_str(&format!("  Impression: {}\n", report.impression_id));
            out.push_str(&format!("  Steps: {} in {}ms\n", report.steps, report.elapsed_ms));
            out.push_str(&format!("  Final state: {}\n", report.final_state));
            out.push_str(&format!("  Dispatch: {}\n", report.dispatch_state));
            out.push_str(&format!(
                "  Delivered: {} ({} failed)\n",
                report.total_delivered(),
                report.failed
            ));
            for (state, samples) in &report.delivered {
                out.push_str(&format!("    {state}: {samples}\n"));
            }
            out
        }
    }
}

pub fn print_report(report: &SimulationReport, format: &str) {
    println!("{}", format_report(report, format));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> SimulationReport {
        SimulationReport {
            impression_id: "abc".into(),
            steps: 3,
            elapsed_ms: 1200,
            final_state: "pause".into(),
            dispatch_state: "enabled".into(),
            delivered: BTreeMap::from([("playing".to_string(), 2), ("startup".to_string(), 1)]),
            failed: 1,
        }
    }

    #[test]
    fn test_json_report() {
        let json: serde_json::Value =
            serde_json::from_str(&format_report(&report(), "json")).unwrap();
        assert_eq!(json["delivered"]["playing"], 2);
        assert_eq!(json["failed"], 1);
    }

    #[test]
    fn test_text_report() {
        let text = format_report(&report(), "text");
        assert!(text.contains("Delivered: 3 (1 failed)"));
        assert!(text.contains("playing: 2"));
    }

    #[test]
    fn test_table_report() {
        let table = format_report(&report(), "table");
        assert!(table.contains("State"));
        assert!(table.contains("startup"));
    }
}
