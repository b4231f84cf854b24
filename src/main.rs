//! organguard: operator commands for the data core.
//!
//! ```bash
//! organguard compliance   # print the compliance self-check as JSON
//! organguard check-keys   # verify the key passphrase can encrypt and decrypt
//! ```

use std::io::IsTerminal;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use organguard::adapters::cipher::AesGcmPhiCipher;
use organguard::adapters::keyring::PassphraseKeyProvider;
use organguard::adapters::sanitize::SanitizingMakeWriter;
use organguard::adapters::sqlite::SqlitePersistence;
use organguard::application::{CheckStatus, OrganGuard};
use organguard::config::{Config, LogMode};
use organguard::domain::kdf::KdfParams;
use organguard::domain::CipherMode;
use organguard::ports::KeyProvider;
use organguard::CallerContext;

const USAGE: &str = "usage: organguard <compliance|check-keys>";

fn init_logging(config: &Config) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let use_file = match config.log_mode {
        LogMode::File => true,
        LogMode::Console => false,
        LogMode::Auto => std::io::stderr().is_terminal(),
    };

    let (writer, guard) = if use_file {
        if let Some(parent) = config.log_file.parent() {
            // Best-effort: a missing directory surfaces as the open error below.
            let _ = std::fs::create_dir_all(parent);
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log_file)
            .with_context(|| format!("opening log file {}", config.log_file.display()))?;
        tracing_appender::non_blocking(file)
    } else {
        tracing_appender::non_blocking(std::io::stderr())
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer().with_writer(
                SanitizingMakeWriter::new(writer).with_max_bytes(config.sanitize_max_bytes),
            ),
        )
        .init();

    Ok(guard)
}

fn run_compliance(config: &Config) -> Result<ExitCode> {
    let guard = OrganGuard::<SqlitePersistence>::open(config).context("opening data core")?;
    let report = guard.compliance_report(&CallerContext::system())?;
    guard.flush();

    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(match report.overall() {
        CheckStatus::Fail => ExitCode::from(2),
        CheckStatus::Pass | CheckStatus::Warn => ExitCode::SUCCESS,
    })
}

fn run_check_keys(config: &Config) -> Result<ExitCode> {
    let keys: Arc<dyn KeyProvider> = Arc::new(
        PassphraseKeyProvider::from_secret_sources(
            config.installation_salt.clone(),
            config.key_version,
            KdfParams::default(),
        )
        .context("loading key passphrase")?,
    );
    let key = keys.current_key()?;
    let cipher = AesGcmPhiCipher::new(Arc::clone(&keys));

    let sample = json!({"check": "organguard"});
    for mode in [CipherMode::Deterministic, CipherMode::Randomized] {
        let sealed = cipher.encrypt_value("keyCheck", &sample, mode)?;
        let opened = cipher.decrypt_value("keyCheck", &sealed)?;
        if opened != sample {
            bail!("{} round trip returned a different value", mode.algorithm_id());
        }
    }

    println!(
        "{}",
        json!({
            "status": "ok",
            "keyVersion": key.version(),
            "fingerprint": key.fingerprint(),
        })
    );
    Ok(ExitCode::SUCCESS)
}

fn main() -> Result<ExitCode> {
    let config = Config::from_env();
    let _guard = init_logging(&config)?;

    let command = std::env::args().nth(1).unwrap_or_default();
    tracing::info!(command = %command, "Starting organguard");

    let code = match command.as_str() {
        "compliance" => run_compliance(&config)?,
        "check-keys" => run_check_keys(&config)?,
        _ => {
            eprintln!("{USAGE}");
            ExitCode::from(64)
        }
    };

    tracing::info!("organguard finished");
    Ok(code)
}
