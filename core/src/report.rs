use std::{fs, path::Path};

use anyhow::{anyhow, Context, Result};

pub const DEFAULT_REPORT_TEMPLATE: &str = r"# Experiment Notebook

<!-- SECTION:overview start -->
<!-- Describe what is being compared and why. -->
<!-- SECTION:overview end -->

## Configuration

<!-- SECTION:configuration start -->
<!-- Populated automatically with the configurations of the latest run. -->
<!-- SECTION:configuration end -->

## Metrics

<!-- SECTION:metrics start -->
<!-- Populated automatically with per-epoch training summaries. -->
<!-- SECTION:metrics end -->

## Loss Curves

<!-- SECTION:curves start -->
<!-- Populated automatically with the overlaid training loss chart. -->
<!-- SECTION:curves end -->

> Sections may be added or renamed freely. Keep the `<!-- SECTION:name start/end -->` markers
> around any region that should be rewritten by the experiment.
";

/// Replacement content for one marked region of a report.
#[derive(Clone, Debug)]
pub struct ReportSection {
    id: String,
    content: String,
}

impl ReportSection {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
        }
    }

    fn start_marker(&self) -> String {
        format!("<!-- SECTION:{} start -->", self.id)
    }

    fn end_marker(&self) -> String {
        format!("<!-- SECTION:{} end -->", self.id)
    }
}

pub fn ensure_report_file(path: &Path, template: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    if !path.exists() {
        fs::write(path, template)
            .with_context(|| format!("failed to write report template to {}", path.display()))?;
    }

    Ok(())
}

pub fn update_sections(path: &Path, sections: &[ReportSection]) -> Result<()> {
    let mut content = fs::read_to_string(path)
        .with_context(|| format!("failed to read report at {}", path.display()))?;

    for section in sections {
        content = replace_section(&content, section)?;
    }

    fs::write(path, content)
        .with_context(|| format!("failed to write updated report to {}", path.display()))?;
    Ok(())
}

fn replace_section(content: &str, section: &ReportSection) -> Result<String> {
    let start_marker = section.start_marker();
    let end_marker = section.end_marker();

    let start_idx = content
        .find(&start_marker)
        .ok_or_else(|| anyhow!("missing start marker: {}", start_marker))?;
    let after_start = start_idx + start_marker.len();
    let end_idx = content[after_start..]
        .find(&end_marker)
        .map(|offset| after_start + offset)
        .ok_or_else(|| anyhow!("missing end marker: {}", end_marker))?;

    let body = section.content.trim_matches('\n');
    let mut updated = String::with_capacity(content.len() + body.len());
    updated.push_str(&content[..after_start]);
    updated.push('\n');
    if !body.is_empty() {
        updated.push_str(body);
        updated.push('\n');
    }
    updated.push_str(&content[end_idx..]);

    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replaces_only_the_marked_region() {
        let template = "head\n<!-- SECTION:a start -->\nold\n<!-- SECTION:a end -->\ntail\n";
        let updated = replace_section(template, &ReportSection::new("a", "\nnew body\n\n")).unwrap();

        assert_eq!(
            updated,
            "head\n<!-- SECTION:a start -->\nnew body\n<!-- SECTION:a end -->\ntail\n"
        );
    }

    #[test]
    fn empty_content_leaves_markers_adjacent() {
        let template = "<!-- SECTION:a start -->\nold\n<!-- SECTION:a end -->";
        let updated = replace_section(template, &ReportSection::new("a", "")).unwrap();
        assert_eq!(updated, "<!-- SECTION:a start -->\n<!-- SECTION:a end -->");
    }

    #[test]
    fn missing_markers_are_errors() {
        let err = replace_section("no markers here", &ReportSection::new("curves", "x")).unwrap_err();
        assert!(err.to_string().contains("SECTION:curves start"));
    }

    #[test]
    fn template_round_trips_through_the_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs/report.md");

        ensure_report_file(&path, DEFAULT_REPORT_TEMPLATE).unwrap();
        update_sections(
            &path,
            &[
                ReportSection::new("metrics", "| Epoch | Loss |"),
                ReportSection::new("curves", "![chart](loss_curves.png)"),
            ],
        )
        .unwrap();

        let report = fs::read_to_string(&path).unwrap();
        assert!(report.contains("<!-- SECTION:metrics start -->\n| Epoch | Loss |\n"));
        assert!(report.contains("![chart](loss_curves.png)"));

        // An existing report is never overwritten by the template.
        ensure_report_file(&path, DEFAULT_REPORT_TEMPLATE).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), report);
    }
}
