//! vaultsync - sync every configured account into the archive, then verify it

use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use log::{error, info, warn};
use mailvault::{
    ArchiveConfig, ArchiveStore, CancellationToken, FileSecretStore, MailIndex, SecretStore,
    SyncCoordinator, SyncOptions, SyncReport, VerificationEngine, open_provider,
};

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    if let Err(e) = config::init() {
        error!("Failed to initialize config directory: {}", e);
    }

    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(2),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// Ok(false) when any account failed or the archive has integrity issues
fn run() -> Result<bool> {
    let settings = ArchiveConfig::load()?;
    settings.validate()?;
    if settings.accounts.is_empty() {
        match config::config_path("config.json") {
            Some(path) => warn!("No accounts configured; add them to {}", path.display()),
            None => warn!("No accounts configured"),
        }
    }

    let store = Arc::new(ArchiveStore::open(&settings.archive_root)?);
    let index = Arc::new(MailIndex::open(settings.index_dir())?);
    let secrets: Arc<dyn SecretStore> =
        Arc::new(FileSecretStore::open_default().context("Failed to open secret store")?);

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        info!("Interrupted; finishing the current message");
        handler_token.cancel();
    })
    .context("Failed to install Ctrl-C handler")?;

    info!(
        "Syncing {} accounts into {}",
        settings.accounts.len(),
        settings.archive_root.display()
    );

    let coordinator = SyncCoordinator::new(
        Arc::clone(&store),
        Arc::clone(&index),
        SyncOptions::from(&settings.sync),
    )
    .with_progress(|progress| {
        if progress.processed % 100 == 0 {
            info!(
                "Progress: {}/{} ({} failed)",
                progress.processed, progress.total, progress.failed
            );
        }
    });

    let outcomes: Vec<Option<SyncReport>> = thread::scope(|scope| {
        let handles: Vec<_> = settings
            .accounts
            .iter()
            .map(|account| {
                let (coordinator, secrets, cancel) = (&coordinator, &secrets, &cancel);
                scope.spawn(move || {
                    let mut provider =
                        match open_provider(account, Arc::clone(secrets), settings.sync.fetch_workers) {
                            Ok(provider) => provider,
                            Err(e) => {
                                error!("{}: cannot open provider: {}", account.address, e);
                                return None;
                            }
                        };
                    match coordinator.run(provider.as_mut(), cancel) {
                        Ok(report) => Some(report),
                        Err(e) => {
                            error!("{}: {}", account.address, e);
                            None
                        }
                    }
                })
            })
            .collect();

        handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or_else(|_| None))
            .collect()
    });

    let mut healthy = outcomes.len() == settings.accounts.len();
    for report in &outcomes {
        match report {
            Some(report) => {
                info!(
                    "{}: {:?}, archived {}, skipped {}, failed {}",
                    report.account,
                    report.state,
                    report.archived,
                    report.skipped,
                    report.failed.len()
                );
                healthy &= report.failed.is_empty();
            }
            None => healthy = false,
        }
    }

    if cancel.is_cancelled() {
        info!("Cancelled; skipping verification");
        return Ok(healthy);
    }

    let verify = VerificationEngine::new(Arc::clone(&store), Arc::clone(&index)).verify()?;
    let stats = index.stats()?;
    info!(
        "Archive holds {} messages ({} degraded); {} integrity issues",
        stats.messages,
        stats.degraded,
        verify.issues.len()
    );

    Ok(healthy && verify.is_clean())
}
