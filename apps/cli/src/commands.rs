//! CLI command implementations

use crate::output::{format_bytes, format_rate, print_json, truncate};
use crate::progress::TransferProgress;
use crate::{ConfigAction, FetchArgs, OutputFormat};
use anyhow::{anyhow, bail, Context, Result};
use bundlekit_core::{
    read_metadata, set_value, validate, validate_cached, verify_digest, DownloadEngine,
    EngineOptions, MainQueue, SettingsStore, TransferJob, WorkerRegistry,
};
use bundlekit_types::{BundleInfo, ChecksumKind, Settings};
use console::style;
use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tabled::{Table, Tabled};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

// ============================================================================
// Fetch Command
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
enum FetchStatus {
    Downloaded,
    Cached,
    Failed,
}

#[derive(Debug, Serialize)]
struct FetchReport {
    name: String,
    path: PathBuf,
    status: FetchStatus,
    bytes: u64,
    attempts: u32,
    checksum: Option<String>,
    error: Option<String>,
}

impl FetchReport {
    fn cached(info: &BundleInfo, path: PathBuf, checksum: Option<String>) -> Self {
        Self {
            name: info.name.clone(),
            path,
            status: FetchStatus::Cached,
            bytes: info.size,
            attempts: 0,
            checksum,
            error: None,
        }
    }

    fn from_job(job: &TransferJob) -> Self {
        Self {
            name: job.name().to_string(),
            path: job.path().to_path_buf(),
            status: if job.is_success() {
                FetchStatus::Downloaded
            } else {
                FetchStatus::Failed
            },
            bytes: job.bytes(),
            attempts: job.tried() + u32::from(job.is_success()),
            checksum: job.verified().map(|meta| meta.checksum.clone()),
            error: job.error().map(str::to_string),
        }
    }
}

pub async fn fetch(store: &SettingsStore, args: FetchArgs, format: OutputFormat) -> Result<()> {
    let mut settings = store.load().await?;
    if !args.base_urls.is_empty() {
        let mut base_urls = args.base_urls.clone();
        base_urls.append(&mut settings.base_urls);
        settings.base_urls = base_urls;
    }
    if let Some(rate) = args.rate {
        settings.rate_limit = rate;
    }
    if let Some(retries) = args.retries {
        settings.max_retries = retries;
    }
    if let Some(algorithm) = args.algorithm {
        settings.checksum = algorithm;
    }
    validate(&settings)?;

    let bundles = collect_bundles(&args).await?;
    let out_dir = args.out.clone().unwrap_or_else(|| settings.cache_dir.clone());

    let mut main = MainQueue::new();
    let registry = WorkerRegistry::new();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let engine = DownloadEngine::new(
        EngineOptions::from_settings(&settings),
        &registry,
        Arc::new(main.handle()),
        move |job| {
            let _ = done_tx.send(job);
        },
    )?;
    let mut events = engine.subscribe();
    let mut progress = TransferProgress::new(format == OutputFormat::Human);

    let mut reports = Vec::new();
    let mut remaining = 0usize;
    for info in &bundles {
        let path = out_dir.join(&info.name);
        if !args.force && validate_cached(&path, info).await? {
            let checksum = read_metadata(&path).await?.map(|meta| meta.checksum);
            debug!("{} is cached at {}", info.name, path.display());
            reports.push(FetchReport::cached(info, path, checksum));
            continue;
        }

        let mut job = TransferJob::for_bundle(info, &out_dir).with_settings(&settings);
        if let Some(url) = &args.url {
            job = job.with_url(url.clone());
        }
        progress.add_job(&job);
        engine
            .enqueue(job)
            .map_err(|job| anyhow!("engine refused {}", job.name()))?;
        remaining += 1;
    }

    info!("Fetching {} bundle(s) into {}", remaining, out_dir.display());

    while remaining > 0 {
        tokio::select! {
            ran = main.next() => {
                if !ran {
                    break;
                }
                while let Ok(job) = done_rx.try_recv() {
                    remaining -= 1;
                    reports.push(FetchReport::from_job(&job));
                }
            }
            event = events.recv() => match event {
                Ok(event) => progress.handle_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Progress display skipped {} event(s)", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                registry.shutdown_all();
                progress.clear();
                bail!("interrupted; partial downloads are kept and resume on the next fetch");
            }
        }
    }

    registry.shutdown_all();
    drop(progress);

    print_fetch_reports(&reports, format)?;

    let failed = reports
        .iter()
        .filter(|report| matches!(report.status, FetchStatus::Failed))
        .count();
    if failed > 0 {
        bail!("{} of {} bundle(s) failed", failed, reports.len());
    }
    Ok(())
}

/// Bundle descriptors from the manifest and the positional names
async fn collect_bundles(args: &FetchArgs) -> Result<Vec<BundleInfo>> {
    let mut bundles: Vec<BundleInfo> = match &args.manifest {
        Some(path) => {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading manifest {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("parsing manifest {}", path.display()))?
        }
        None => Vec::new(),
    };
    bundles.extend(args.names.iter().map(BundleInfo::new));

    if bundles.is_empty() {
        bail!("nothing to fetch: pass bundle names or --manifest");
    }
    for info in &bundles {
        check_name(&info.name)?;
    }

    let per_bundle = args.url.is_some() || args.checksum.is_some() || args.size.is_some();
    if per_bundle {
        let [info] = bundles.as_mut_slice() else {
            bail!("--url, --checksum and --size need exactly one bundle");
        };
        if let Some(checksum) = &args.checksum {
            info.checksum = Some(checksum.clone());
        }
        if let Some(size) = args.size {
            info.size = size;
        }
    }

    Ok(bundles)
}

/// Names become file names under the output directory
fn check_name(name: &str) -> Result<()> {
    let path = Path::new(name);
    if name.is_empty() || !path.components().all(|c| matches!(c, Component::Normal(_))) {
        bail!("invalid bundle name: {:?}", name);
    }
    Ok(())
}

fn print_fetch_reports(reports: &[FetchReport], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(reports)?,
        OutputFormat::Table => {
            #[derive(Tabled)]
            struct FetchRow {
                name: String,
                status: String,
                size: String,
                attempts: u32,
                checksum: String,
            }

            let rows: Vec<FetchRow> = reports
                .iter()
                .map(|r| FetchRow {
                    name: truncate(&r.name, 30),
                    status: match &r.error {
                        Some(error) => format!("failed: {}", truncate(error, 40)),
                        None => format!("{:?}", r.status).to_lowercase(),
                    },
                    size: format_bytes(r.bytes),
                    attempts: r.attempts,
                    checksum: r.checksum.clone().unwrap_or_else(|| "-".to_string()),
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            for report in reports {
                if matches!(report.status, FetchStatus::Cached) {
                    println!(
                        "{} {} {}",
                        style("=").dim(),
                        style(&report.name).cyan(),
                        style("(cached)").dim()
                    );
                }
            }
            let count = |status: fn(&FetchStatus) -> bool| {
                reports.iter().filter(|r| status(&r.status)).count()
            };
            println!();
            println!(
                "{} downloaded, {} cached, {} failed",
                style(count(|s| matches!(s, FetchStatus::Downloaded))).green().bold(),
                style(count(|s| matches!(s, FetchStatus::Cached))).bold(),
                style(count(|s| matches!(s, FetchStatus::Failed))).red().bold()
            );
        }
    }
    Ok(())
}

// ============================================================================
// Verify Command
// ============================================================================

#[derive(Debug, Serialize)]
struct VerifyReport {
    path: PathBuf,
    size: Option<u64>,
    checksum: Option<String>,
    valid: bool,
    reason: Option<String>,
}

pub async fn verify(
    store: &SettingsStore,
    paths: Vec<PathBuf>,
    deep: bool,
    algorithm: Option<ChecksumKind>,
    format: OutputFormat,
) -> Result<()> {
    let kind = match algorithm {
        Some(kind) => kind,
        None => store.load().await?.checksum,
    };

    let mut reports = Vec::with_capacity(paths.len());
    for path in paths {
        reports.push(verify_one(path, deep, kind).await);
    }

    match format {
        OutputFormat::Json => print_json(&reports)?,
        OutputFormat::Table => {
            #[derive(Tabled)]
            struct VerifyRow {
                path: String,
                size: String,
                checksum: String,
                result: String,
            }

            let rows: Vec<VerifyRow> = reports
                .iter()
                .map(|r| VerifyRow {
                    path: truncate(&r.path.display().to_string(), 40),
                    size: r.size.map(format_bytes).unwrap_or_else(|| "?".to_string()),
                    checksum: r.checksum.clone().unwrap_or_else(|| "-".to_string()),
                    result: r
                        .reason
                        .clone()
                        .unwrap_or_else(|| "ok".to_string()),
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            for report in &reports {
                match &report.reason {
                    None => println!(
                        "{} {}",
                        style("✓").green().bold(),
                        report.path.display()
                    ),
                    Some(reason) => println!(
                        "{} {}: {}",
                        style("✗").red().bold(),
                        report.path.display(),
                        reason
                    ),
                }
            }
        }
    }

    let invalid = reports.iter().filter(|r| !r.valid).count();
    if invalid > 0 {
        bail!("{} of {} bundle(s) failed verification", invalid, reports.len());
    }
    Ok(())
}

async fn verify_one(path: PathBuf, deep: bool, kind: ChecksumKind) -> VerifyReport {
    let mut report = VerifyReport {
        path,
        size: None,
        checksum: None,
        valid: false,
        reason: None,
    };

    let meta = match read_metadata(&report.path).await {
        Ok(Some(meta)) => meta,
        Ok(None) => {
            report.reason = Some("no sidecar record".to_string());
            return report;
        }
        Err(e) => {
            report.reason = Some(e.to_string());
            return report;
        }
    };
    report.size = Some(meta.size);
    report.checksum = Some(meta.checksum);

    let name = report
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    match validate_cached(&report.path, &BundleInfo::new(name)).await {
        Ok(true) => {}
        Ok(false) => {
            report.reason = Some("size differs from sidecar".to_string());
            return report;
        }
        Err(e) => {
            report.reason = Some(e.to_string());
            return report;
        }
    }

    if deep {
        match verify_digest(&report.path, kind).await {
            Ok(true) => {}
            Ok(false) => {
                report.reason = Some(format!("{} digest differs from sidecar", kind));
                return report;
            }
            Err(e) => {
                report.reason = Some(e.to_string());
                return report;
            }
        }
    }

    report.valid = true;
    report
}

// ============================================================================
// Config Commands
// ============================================================================

pub async fn config_action(
    store: &SettingsStore,
    action: Option<ConfigAction>,
    format: OutputFormat,
) -> Result<()> {
    match action {
        None | Some(ConfigAction::Show) => {
            let settings = store.load().await?;
            show_settings(store, &settings, format)?;
        }

        Some(ConfigAction::Get { key }) => {
            let settings = store.load().await?;
            let document = serde_json::to_value(&settings)?;
            let value = document
                .get(&key)
                .ok_or_else(|| anyhow!("Unknown config key: {}", key))?;
            match value {
                serde_json::Value::String(s) => println!("{}", s),
                other => println!("{}", other),
            }
        }

        Some(ConfigAction::Set { key, value }) => {
            let settings = store.load().await?;
            let updated = set_value(&settings, &key, &value)?;
            store.save(&updated).await?;
            println!("{} Config updated", style("✓").green().bold());
        }

        Some(ConfigAction::Init { force }) => {
            if store.path().exists() && !force {
                bail!(
                    "{} already exists (use --force to overwrite)",
                    store.path().display()
                );
            }
            store.save(&Settings::default()).await?;
            println!(
                "{} Wrote {}",
                style("✓").green().bold(),
                store.path().display()
            );
        }

        Some(ConfigAction::Reset { yes }) => {
            use dialoguer::Confirm;

            let confirmed = yes
                || Confirm::new()
                    .with_prompt("Reset all settings to defaults?")
                    .default(false)
                    .interact()?;

            if confirmed {
                store.save(&Settings::default()).await?;
                println!("{} Settings reset to defaults", style("✓").green().bold());
            }
        }
    }

    Ok(())
}

fn show_settings(store: &SettingsStore, settings: &Settings, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(settings)?,
        OutputFormat::Table => {
            #[derive(Tabled)]
            struct SettingRow {
                key: String,
                value: String,
            }

            let document = serde_json::to_value(settings)?;
            let rows: Vec<SettingRow> = document
                .as_object()
                .into_iter()
                .flatten()
                .map(|(key, value)| SettingRow {
                    key: key.clone(),
                    value: value.to_string(),
                })
                .collect();

            println!("{}", Table::new(rows));
        }
        OutputFormat::Human => {
            println!("bundlekit configuration ({}):", store.path().display());
            println!();
            if settings.base_urls.is_empty() {
                println!("  Base URLs: {}", style("none").dim());
            } else {
                println!("  Base URLs:");
                for base in &settings.base_urls {
                    println!("    {}", base);
                }
            }
            println!("  Cache directory: {}", settings.cache_dir.display());
            println!("  Buffer size: {}", format_bytes(settings.buffer_size as u64));
            println!("  Rate limit: {}", format_rate(settings.rate_limit));
            println!(
                "  Retries: {}",
                if settings.max_retries == 0 {
                    "unlimited".to_string()
                } else {
                    settings.max_retries.to_string()
                }
            );
            println!("  Retry back-off: {} ms", settings.retry_backoff_ms);
            println!(
                "  Timeouts: connect {}s, read {}s",
                settings.connect_timeout_secs, settings.read_timeout_secs
            );
            println!("  Checksum: {}", settings.checksum);
            println!("  Worker priority: {:?}", settings.worker_priority);
            println!("  User agent: {}", settings.user_agent);
        }
    }
    Ok(())
}
