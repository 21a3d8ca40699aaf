//! Localgate - local hardware gateway daemon
//!
//! Provisions the local root CA and transport certificate, installs the root
//! into the OS and browser trust stores, and serves the WebSocket gateway.
//!
//! ```bash
//! localgate                      # same as `localgate run`
//! localgate certgen --host "localhost;printer.local" --force
//! localgate certgen --pfx site.p12 --pass secret
//! localgate install-trust
//! localgate block evil-vendor.pem
//! ```

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use localgate::browser_trust::{locator, BrowserTrustInstaller};
use localgate::certificate_chain_builder::parse_host_list;
use localgate::certificate_manager::{CertificateManager, StorageLocations, APP_NAME};
use localgate::configs::AppConfig;
use localgate::consent_prompt::{ConsentPrompt, HeadlessPrompt, TerminalPrompt};
use localgate::decision_store::{DecisionList, DecisionStore};
use localgate::device_backend::UnavailableBackend;
use localgate::identity::IdentityCertificate;
use localgate::native_installer::{self, ensure_trusted, InstallOutcome, NativeTrustStore, PrivilegeLevel, StoreIdentity};
use localgate::platform::Platform;
use localgate::request_authorizer::RequestAuthorizer;
use localgate::shell::{CommandRunner, SystemRunner};
use localgate::tls_context::server_config;
use localgate::webserver::{self, Gateway};
use openssl::x509::X509;
use secrecy::SecretString;
use std::fs;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const RENEWAL_CHECK_PERIOD: Duration = Duration::from_secs(12 * 60 * 60);

#[derive(Parser)]
#[command(name = "localgate")]
#[command(about = "Local hardware gateway: certificate provisioning, trust installation and consent-gated device access")]
#[command(version)]
struct Cli {
    /// Configuration file (default: ./localgate.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway daemon
    Run,

    /// Generate (or import) the root and transport certificates
    Certgen {
        /// PEM private key to use for the transport certificate
        #[arg(long, requires = "cert")]
        key: Option<PathBuf>,
        /// PEM certificate (chain) matching --key
        #[arg(long, requires = "key")]
        cert: Option<PathBuf>,
        /// PKCS#12 keystore to import instead
        #[arg(long, conflicts_with_all = ["key", "cert"])]
        pfx: Option<PathBuf>,
        /// Password of --pfx
        #[arg(long, requires = "pfx")]
        pass: Option<String>,
        /// Host names, semicolon separated
        #[arg(long)]
        host: Option<String>,
        /// Replace existing material
        #[arg(long)]
        force: bool,
    },

    /// Renew the transport certificate, keeping the root
    Renew {
        /// Host names, semicolon separated
        #[arg(long)]
        host: Option<String>,
    },

    /// Install the root into the OS and browser trust stores
    InstallTrust,

    /// Remove the root from the OS trust store and browser auto-config
    UninstallTrust,

    /// Report whether the OS trusts the current root
    VerifyTrust,

    /// Print the allow and block lists
    ListDecisions,

    /// Allow a caller certificate without prompting
    Allow {
        /// PEM identity certificate
        certificate: PathBuf,
    },

    /// Block a caller certificate without prompting
    Block {
        /// PEM identity certificate
        certificate: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let platform = Platform::current();
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&config, platform),
        Commands::Certgen {
            key,
            cert,
            pfx,
            pass,
            host,
            force,
        } => {
            let locations = storage_locations(&config, platform);
            let mut manager = match (key, cert, pfx) {
                (Some(key), Some(cert), _) => CertificateManager::import_pem(locations, &key, &cert)?,
                (_, _, Some(pfx)) => {
                    let password = SecretString::from(pass.unwrap_or_default());
                    CertificateManager::import_pkcs12(locations, &pfx, password)?
                }
                _ => {
                    let hosts = host_names(host.as_deref(), &config);
                    CertificateManager::load_or_create(locations, &hosts, force || config.certificates.force_new)?
                }
            };
            if manager.ca().is_some() {
                let root = manager.root_certificate_file()?;
                println!("Root certificate: {}", root.display());
            }
            println!("Trust manifest written for {}", manager.bind_host());
            Ok(())
        }
        Commands::Renew { host } => {
            let hosts = host_names(host.as_deref(), &config);
            let mut manager = CertificateManager::load_or_create(storage_locations(&config, platform), &hosts, false)?;
            manager.renew(&hosts)?;
            println!("Transport certificate renewed, valid for {} days", manager.leaf_days_remaining()?);
            Ok(())
        }
        Commands::InstallTrust => {
            let mut manager = load_manager(&config, platform)?;
            install_trust(&mut manager, &config, platform, true)
        }
        Commands::UninstallTrust => {
            let manager = CertificateManager::load_existing(storage_locations(&config, platform))?;
            let store = native_store(&manager, platform);
            if store.uninstall() {
                println!("Removed {} entries from the {} trust store", APP_NAME, store.privilege());
            } else {
                warn!("Some trust store entries could not be removed");
            }
            if config.browser.enabled {
                let removed = browser_installer(platform).uninstall();
                println!("Removed browser auto-config from {} installation(s)", removed);
            }
            Ok(())
        }
        Commands::VerifyTrust => {
            let mut manager = CertificateManager::load_existing(storage_locations(&config, platform))?;
            let root = manager.root_certificate_file()?;
            let store = native_store(&manager, platform);
            if store.verify(&root) {
                println!("{} is trusted by the {} store", root.display(), store.privilege());
            } else {
                println!("{} is NOT trusted by the {} store", root.display(), store.privilege());
            }
            Ok(())
        }
        Commands::ListDecisions => {
            let decisions = DecisionStore::new(decision_dir(&config, platform));
            for (label, list) in [("Allowed", DecisionList::Allow), ("Blocked", DecisionList::Block)] {
                let entries = decisions.entries(list)?;
                println!("{} ({}): {}", label, entries.len(), decisions.path(list).display());
                for entry in entries {
                    println!("  {}  {}  valid {} to {}", entry.fingerprint(), entry, entry.valid_from(), entry.valid_to());
                }
            }
            Ok(())
        }
        Commands::Allow { certificate } => remember(&config, platform, DecisionList::Allow, &certificate),
        Commands::Block { certificate } => remember(&config, platform, DecisionList::Block, &certificate),
    }
}

fn run(config: &AppConfig, platform: Platform) -> Result<()> {
    let hosts = config.certificates.host_names.clone();
    let manager = match CertificateManager::load_or_create(
        storage_locations(config, platform),
        &hosts,
        config.certificates.force_new,
    ) {
        Ok(manager) => Some(manager),
        Err(e) => {
            warn!("Could not provision certificates, secure listener disabled: {:#}", e);
            None
        }
    };

    let mut tls = None;
    let manager = match manager {
        Some(mut manager) => {
            if config.certificates.install_trust {
                let force = manager.needs_install();
                if let Err(e) = install_trust(&mut manager, config, platform, force) {
                    warn!("Trust installation failed: {:#}", e);
                }
            }
            match manager.security_context().and_then(server_config) {
                Ok(server) => tls = Some(server),
                Err(e) => warn!("Could not build the TLS context: {:#}", e),
            }
            Some(Arc::new(Mutex::new(manager)))
        }
        None => None,
    };

    let decisions = Arc::new(DecisionStore::new(decision_dir(config, platform)));
    let authorizer = RequestAuthorizer::new(decisions, consent_prompt(config), config.authorization.prompt_timeout())
        .with_block_anonymous(config.authorization.block_anonymous);
    let gateway = Arc::new(Gateway::new(
        authorizer,
        Arc::new(UnavailableBackend),
        trusted_root(config.authorization.trusted_root.as_deref()),
    ));

    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    rt.block_on(async {
        if let Some(manager) = &manager {
            webserver::spawn_renewal_watcher(
                Arc::clone(manager),
                hosts.clone(),
                config.certificates.renew_within_days,
                RENEWAL_CHECK_PERIOD,
            );
        }
        webserver::serve(gateway, &config.server, tls).await
    })
}

fn install_trust(manager: &mut CertificateManager, config: &AppConfig, platform: Platform, force: bool) -> Result<()> {
    let root_file = manager.root_certificate_file()?;
    let store = native_store(manager, platform);
    match ensure_trusted(store.as_ref(), &root_file, force) {
        InstallOutcome::AlreadyTrusted | InstallOutcome::Installed => {}
        InstallOutcome::ManualInstallRequired(path) => warn!("Manual trust installation needed for {}", path.display()),
        InstallOutcome::Failed => warn!("Root certificate is not trusted by the {} store", store.privilege()),
    }

    if config.browser.enabled && force {
        let root = manager
            .ca()
            .ok_or_else(|| anyhow!("No root CA to install into browsers"))?
            .certificate();
        let installed = browser_installer(platform).install(root, &config.certificates.host_names);
        info!("Browser trust installed for {} installation(s)", installed);
    }
    Ok(())
}

fn native_store(manager: &CertificateManager, platform: Platform) -> Box<dyn NativeTrustStore> {
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
    let privilege = PrivilegeLevel::detect(platform, runner.as_ref());
    let identity = StoreIdentity::from_certificate_identity(manager.identity());
    native_installer::for_platform(platform, privilege, identity, runner)
}

fn browser_installer(platform: Platform) -> BrowserTrustInstaller {
    BrowserTrustInstaller::new(platform, locator::for_platform(platform, Arc::new(SystemRunner)))
}

fn load_manager(config: &AppConfig, platform: Platform) -> Result<CertificateManager> {
    CertificateManager::load_or_create(
        storage_locations(config, platform),
        &config.certificates.host_names,
        false,
    )
}

fn storage_locations(config: &AppConfig, platform: Platform) -> StorageLocations {
    if config.certificates.data_dirs.is_empty() {
        StorageLocations::for_platform(platform, None)
    } else {
        StorageLocations::from_dirs(config.certificates.data_dirs.clone())
    }
}

fn decision_dir(config: &AppConfig, platform: Platform) -> PathBuf {
    config
        .authorization
        .decision_dir
        .clone()
        .unwrap_or_else(|| platform.user_dir(APP_NAME))
}

fn host_names(arg: Option<&str>, config: &AppConfig) -> Vec<String> {
    match arg {
        Some(list) => parse_host_list(list),
        None => config.certificates.host_names.clone(),
    }
}

fn consent_prompt(config: &AppConfig) -> Arc<dyn ConsentPrompt> {
    if config.authorization.headless {
        return Arc::new(HeadlessPrompt);
    }
    if !std::io::stdin().is_terminal() {
        warn!("No terminal attached, requests that need consent will be denied");
        return Arc::new(HeadlessPrompt);
    }
    Arc::new(TerminalPrompt)
}

/// Root that caller certificates must chain to; unreadable means none are trusted
fn trusted_root(path: Option<&Path>) -> Option<X509> {
    let path = path?;
    let loaded = fs::read(path)
        .context(format!("Failed to read {}", path.display()))
        .and_then(|pem| X509::from_pem(&pem).map_err(|e| anyhow!("Invalid certificate {}: {}", path.display(), e)));
    match loaded {
        Ok(root) => Some(root),
        Err(e) => {
            warn!("Caller certificates will not be trusted: {:#}", e);
            None
        }
    }
}

fn remember(config: &AppConfig, platform: Platform, list: DecisionList, certificate: &Path) -> Result<()> {
    let pem = fs::read_to_string(certificate).context(format!("Failed to read {}", certificate.display()))?;
    let root = trusted_root(config.authorization.trusted_root.as_deref());
    let identity = IdentityCertificate::from_pem(&pem, root.as_deref())?;
    let decisions = DecisionStore::new(decision_dir(config, platform));
    decisions.remember(list, &identity)?;
    println!("{} -> {}", identity, decisions.path(list).display());
    Ok(())
}
