// src/utils/report.rs: browsable index over extracted visualizations

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::defs::{PipelineError, REPORT_INDEX};

/// One extracted visualization under `reports/<name>/`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportEntry {
    pub name: String,
    pub kind: String,
    pub uuid: String,
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Writes `reports_dir/index.html` linking every entry's own `index.html`.
pub fn write_report_index(reports_dir: &Path, entries: &[ReportEntry]) -> Result<PathBuf, PipelineError> {
    let mut html = String::from(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>Amplicon reports</title>\n</head>\n<body>\n<h1>Amplicon reports</h1>\n<ul>\n",
    );
    for entry in entries {
        let name = escape_html(&entry.name);
        html.push_str(&format!(
            "  <li><a href=\"{}/{}\">{}</a> <small>{} ({})</small></li>\n",
            name,
            REPORT_INDEX,
            name,
            escape_html(&entry.kind),
            escape_html(&entry.uuid)
        ));
    }
    html.push_str("</ul>\n</body>\n</html>\n");

    let index = reports_dir.join(REPORT_INDEX);
    fs::write(&index, html)?;
    Ok(index)
}
