//! Human readable rendering of cache reports

use crate::scan::HubCacheInfo;

const SIZE_UNITS: [&str; 8] = ["", "K", "M", "G", "T", "P", "E", "Z"];

/// (label, seconds per unit, largest value before moving to the next unit)
const TIMESINCE_CHUNKS: [(&str, f64, Option<f64>); 7] = [
    ("second", 1.0, Some(60.0)),
    ("minute", 60.0, Some(60.0)),
    ("hour", 3600.0, Some(24.0)),
    ("day", 86400.0, Some(6.0)),
    ("week", 604800.0, Some(6.0)),
    ("month", 2629800.0, Some(11.0)),
    ("year", 31557600.0, None),
];

/// Decimal size with one digit: `512.0`, `1.2K`, `3.4G`
pub fn format_size(bytes: u64) -> String {
    let mut num = bytes as f64;
    for unit in SIZE_UNITS {
        if num.abs() < 1000.0 {
            return format!("{:.1}{}", num, unit);
        }
        num /= 1000.0;
    }
    format!("{:.1}Y", num)
}

/// Time elapsed since a unix timestamp, e.g. `3 hours ago`
pub fn format_timesince(timestamp: i64) -> String {
    format_elapsed(chrono::Utc::now().timestamp() - timestamp)
}

pub(crate) fn format_elapsed(delta_secs: i64) -> String {
    let delta = delta_secs as f64;
    if delta < 20.0 {
        return "a few seconds ago".to_string();
    }
    let mut value = 0.0;
    let mut label = "";
    for (chunk_label, divider, max_value) in TIMESINCE_CHUNKS {
        value = (delta / divider).round();
        label = chunk_label;
        if max_value.is_some_and(|max| value <= max) {
            break;
        }
    }
    let plural = if value > 1.0 { "s" } else { "" };
    format!("{} {}{} ago", value as i64, label, plural)
}

/// Left-aligned table with a dashed line under the headers
pub fn tabulate(rows: &[Vec<String>], headers: &[&str]) -> String {
    let widths: Vec<usize> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| {
            rows.iter()
                .filter_map(|row| row.get(i))
                .map(|cell| cell.chars().count())
                .chain(std::iter::once(h.chars().count()))
                .max()
                .unwrap_or(0)
        })
        .collect();

    let render = |cells: &[&str]| {
        cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{:<width$}", cell, width = *width))
            .collect::<Vec<_>>()
            .join(" ")
    };

    let dashes: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    let dashes: Vec<&str> = dashes.iter().map(String::as_str).collect();
    let mut lines = vec![render(headers), render(&dashes)];
    for row in rows {
        let cells: Vec<&str> = row.iter().map(String::as_str).collect();
        lines.push(render(&cells));
    }
    lines.join("\n")
}

impl HubCacheInfo {
    /// Table of the scan.
    ///
    /// Verbosity 0 lists one row per repo; 1 and above one row per revision.
    pub fn export_as_table(&self, verbosity: u8) -> String {
        let mut repos: Vec<_> = self.repos.iter().collect();
        repos.sort_by(|a, b| a.repo_path.cmp(&b.repo_path));

        if verbosity == 0 {
            let rows: Vec<Vec<String>> = repos
                .iter()
                .map(|repo| {
                    vec![
                        repo.repo_id.clone(),
                        repo.repo_type.to_string(),
                        format!("{:>12}", repo.size_on_disk_str()),
                        repo.nb_files.to_string(),
                        format_timesince(repo.last_accessed),
                        format_timesince(repo.last_modified),
                        repo.refs().keys().copied().collect::<Vec<_>>().join(", "),
                        repo.repo_path.display().to_string(),
                    ]
                })
                .collect();
            tabulate(
                &rows,
                &[
                    "REPO ID",
                    "REPO TYPE",
                    "SIZE ON DISK",
                    "NB FILES",
                    "LAST_ACCESSED",
                    "LAST_MODIFIED",
                    "REFS",
                    "LOCAL PATH",
                ],
            )
        } else {
            let mut rows = Vec::new();
            for repo in repos {
                let mut revisions: Vec<_> = repo.revisions.iter().collect();
                revisions.sort_by(|a, b| a.commit_hash.cmp(&b.commit_hash));
                for rev in revisions {
                    rows.push(vec![
                        repo.repo_id.clone(),
                        repo.repo_type.to_string(),
                        rev.commit_hash.clone(),
                        format!("{:>12}", rev.size_on_disk_str()),
                        rev.nb_files().to_string(),
                        format_timesince(rev.last_modified),
                        rev.refs.iter().cloned().collect::<Vec<_>>().join(", "),
                        rev.snapshot_path.display().to_string(),
                    ]);
                }
            }
            tabulate(
                &rows,
                &[
                    "REPO ID",
                    "REPO TYPE",
                    "REVISION",
                    "SIZE ON DISK",
                    "NB FILES",
                    "LAST_MODIFIED",
                    "REFS",
                    "LOCAL PATH",
                ],
            )
        }
    }
}
