//! Cache administration: scan, delete, prune, verify

use anyhow::{Result, bail};
use clap::ValueEnum;
use hubcache_core::{
    DeleteCacheStrategy, DeleteReport, HubCacheInfo, VerifyReport, format_size, scan_cache_dir,
    verify_cache,
};
use std::io::Write;
use std::path::Path;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

pub fn scan(
    out: &mut impl Write,
    cache_dir: &Path,
    format: OutputFormat,
    revisions: bool,
    verbose: bool,
) -> Result<HubCacheInfo> {
    let started = Instant::now();
    let info = scan_cache_dir(cache_dir)?;
    let elapsed = started.elapsed().as_secs_f64();

    match format {
        OutputFormat::Json => {
            writeln!(out, "{}", serde_json::to_string_pretty(&info)?)?;
        }
        OutputFormat::Table => {
            writeln!(out, "{}", info.export_as_table(u8::from(revisions)))?;
            writeln!(
                out,
                "\nDone in {:.1}s. Scanned {} repo(s) for a total of {}.",
                elapsed,
                info.repos.len(),
                info.size_on_disk_str()
            )?;
            if !info.warnings.is_empty() {
                write!(out, "Got {} warning(s) while scanning.", info.warnings.len())?;
                if verbose {
                    writeln!(out)?;
                    for warning in &info.warnings {
                        writeln!(out, "  {}", warning)?;
                    }
                } else {
                    writeln!(out, " Use -v to print details.")?;
                }
            }
        }
    }
    Ok(info)
}

pub fn delete(out: &mut impl Write, cache_dir: &Path, hashes: &[String], dry_run: bool) -> Result<Option<DeleteReport>> {
    let info = scan_cache_dir(cache_dir)?;
    let strategy = info.delete_revisions(hashes);
    apply(out, &strategy, dry_run)
}

pub fn prune(out: &mut impl Write, cache_dir: &Path, dry_run: bool) -> Result<Option<DeleteReport>> {
    let info = scan_cache_dir(cache_dir)?;
    let detached = info.detached_revisions();
    writeln!(out, "Found {} detached revision(s).", detached.len())?;
    apply(out, &info.prune(), dry_run)
}

fn apply(out: &mut impl Write, strategy: &DeleteCacheStrategy, dry_run: bool) -> Result<Option<DeleteReport>> {
    for revision in &strategy.not_found {
        writeln!(out, "Revision not found in cache, ignored: {}", revision)?;
    }
    if strategy.is_empty() {
        writeln!(out, "Nothing to delete.")?;
        return Ok(None);
    }

    writeln!(
        out,
        "Will delete {} path(s) and free {}.",
        strategy.paths().count(),
        strategy.expected_freed_size_str()
    )?;
    if dry_run {
        for (kind, path) in strategy.paths() {
            writeln!(out, "  {:<8} {}", kind, path.display())?;
        }
        writeln!(out, "Dry run: nothing deleted.")?;
        return Ok(None);
    }

    let report = strategy.execute();
    writeln!(
        out,
        "Done. Deleted {} path(s) and freed {}.",
        report.deleted.len(),
        format_size(report.freed_size)
    )?;
    for (path, reason) in &report.skipped {
        writeln!(out, "  skipped {}: {}", path.display(), reason)?;
    }
    Ok(Some(report))
}

/// Exits with an error when integrity errors are found
pub fn verify(out: &mut impl Write, cache_dir: &Path, quiet: bool) -> Result<VerifyReport> {
    let info = scan_cache_dir(cache_dir)?;
    if !quiet {
        writeln!(out, "Verifying cache: {}", cache_dir.display())?;
        for warning in &info.warnings {
            writeln!(out, "  WARNING: {}", warning)?;
        }
    }

    let report = verify_cache(&info)?;
    if !quiet {
        for issue in &report.issues {
            let level = if issue.is_error() { "ERROR" } else { "WARNING" };
            writeln!(out, "  {}: {}", level, serde_json::to_string(issue)?)?;
        }
        writeln!(out)?;
        writeln!(
            out,
            "Verified {} repo(s), {} blob(s), {} file(s), {} marker(s): {} error(s), {} warning(s).",
            report.repos_verified,
            report.blobs_verified,
            report.files_verified,
            report.markers_verified,
            report.errors(),
            report.warnings()
        )?;
    }

    if !report.is_ok() {
        bail!("{} integrity error(s) found in {}", report.errors(), cache_dir.display());
    }
    Ok(report)
}
