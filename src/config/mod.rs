//! Plugin arguments and gateway configuration.
//!
//! The CLI surface mirrors how the plugin is loaded by a host proxy:
//! short flags for the logging and engine knobs, one positional for the
//! rules-engine configuration. An optional YAML settings file carries
//! the gateway-level tunables; explicit CLI flags win over it.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::core::{WafError, WafResult};
use crate::waf::MediationSettings;

#[derive(Parser, Debug)]
#[command(
    name = "rampart",
    about = "WAF gateway: a rules-engine mediation layer for proxied HTTP traffic"
)]
pub struct CliOptions {
    /// Disable logging.
    #[arg(short = 'L', long = "no-log")]
    pub disable_logging: bool,

    /// Log file path.
    #[arg(short = 'l', long = "log-file", default_value = "rampart.log")]
    pub log_file: PathBuf,

    /// Verbosity: symbolic (error, warning, notice, info, debug, trace)
    /// or numeric (0-9).
    #[arg(short = 'v', long = "verbosity", default_value = "warning")]
    pub verbosity: String,

    /// Maximum concurrent engine generations.
    #[arg(short = 'm', long = "max-engines", default_value_t = 4)]
    pub max_engines: usize,

    /// Transaction log path.
    #[arg(short = 'x', long = "txlog", default_value = "txlogs/tx-rampart")]
    pub txlog: PathBuf,

    /// Permit traffic through unchecked before the first engine is ready.
    #[arg(short = '0', long = "early-traffic")]
    pub early_traffic: bool,

    /// Listener address.
    #[arg(long = "listen")]
    pub listen: Option<String>,

    /// Origin to proxy to, as host:port.
    #[arg(long = "origin")]
    pub origin: Option<String>,

    /// Connect to the origin over TLS.
    #[arg(long = "tls")]
    pub tls: bool,

    /// SNI to present to the origin; defaults to the origin host.
    #[arg(long = "tls-sni")]
    pub tls_sni: Option<String>,

    /// Notification dispatcher worker threads.
    #[arg(long = "workers")]
    pub workers: Option<usize>,

    /// Gateway settings file (YAML).
    #[arg(short = 's', long = "settings")]
    pub settings: Option<PathBuf>,

    /// Rules-engine configuration file.
    pub engine_config: PathBuf,
}

/// Gateway tunables from the optional settings file.
#[derive(Debug, Default, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct GatewaySettings {
    #[validate(length(min = 1))]
    pub listen: Option<String>,

    #[validate(length(min = 1))]
    pub origin: Option<String>,

    pub tls: Option<bool>,

    pub tls_sni: Option<String>,

    #[validate(range(min = 1, max = 64))]
    pub workers: Option<usize>,

    /// How long a proxy thread parks in a rendezvous, in milliseconds.
    #[validate(range(min = 1))]
    pub rendezvous_timeout_ms: Option<u64>,

    /// Default staged-byte ceiling per direction.
    pub default_buffer_limit: Option<usize>,

    /// Control-channel poll interval, in seconds.
    #[validate(range(min = 1))]
    pub control_poll_secs: Option<u64>,
}

impl GatewaySettings {
    pub fn load(path: &std::path::Path) -> WafResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let settings: GatewaySettings = serde_yaml::from_str(&raw)
            .map_err(|e| WafError::Config(format!("{}: {e}", path.display())))?;
        settings
            .validate()
            .map_err(|e| WafError::Config(format!("{}: {e}", path.display())))?;
        Ok(settings)
    }
}

/// Fully resolved gateway configuration.
#[derive(Debug)]
pub struct GatewayConfig {
    pub listen: String,
    pub origin: String,
    pub origin_tls: bool,
    pub origin_sni: String,
    pub workers: usize,
    pub max_engines: usize,
    pub engine_config: PathBuf,
    pub control_poll: Duration,
    pub log_enabled: bool,
    pub log_level: LevelFilter,
    pub log_file: PathBuf,
    pub txlog: PathBuf,
    pub mediation: MediationSettings,
}

impl GatewayConfig {
    pub fn from_cli(opts: CliOptions) -> WafResult<Self> {
        let settings = match opts.settings {
            Some(ref path) => GatewaySettings::load(path)?,
            None => GatewaySettings::default(),
        };

        let level = parse_verbosity(&opts.verbosity)?;
        let mut mediation = MediationSettings {
            early_traffic: opts.early_traffic,
            ..MediationSettings::default()
        };
        if let Some(ms) = settings.rendezvous_timeout_ms {
            mediation.rendezvous_timeout = Duration::from_millis(ms);
        }
        if let Some(limit) = settings.default_buffer_limit {
            mediation.default_buf_limit = limit;
        }

        let origin = opts
            .origin
            .or(settings.origin)
            .ok_or_else(|| WafError::Config("no origin configured".to_string()))?;
        let origin_sni = opts
            .tls_sni
            .or(settings.tls_sni)
            .unwrap_or_else(|| origin.split(':').next().unwrap_or_default().to_string());

        Ok(Self {
            listen: opts
                .listen
                .or(settings.listen)
                .unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            origin,
            origin_tls: opts.tls || settings.tls.unwrap_or(false),
            origin_sni,
            workers: opts.workers.or(settings.workers).unwrap_or(2),
            max_engines: opts.max_engines.max(1),
            engine_config: opts.engine_config,
            control_poll: Duration::from_secs(settings.control_poll_secs.unwrap_or(10)),
            log_enabled: !opts.disable_logging,
            log_level: level,
            log_file: opts.log_file,
            txlog: opts.txlog,
            mediation,
        })
    }
}

/// Maps the `-v` argument onto a log filter. Symbolic names follow the
/// usual syslog-flavored ladder; numbers ramp 0 (quietest) through 9.
pub fn parse_verbosity(value: &str) -> WafResult<LevelFilter> {
    let lowered = value.trim().to_ascii_lowercase();
    let level = match lowered.as_str() {
        "off" | "none" => LevelFilter::Off,
        "emerg" | "alert" | "crit" | "error" => LevelFilter::Error,
        "warn" | "warning" => LevelFilter::Warn,
        "notice" | "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" | "debug2" | "debug3" => LevelFilter::Trace,
        _ => match lowered.parse::<u8>() {
            Ok(0..=1) => LevelFilter::Error,
            Ok(2..=3) => LevelFilter::Warn,
            Ok(4..=5) => LevelFilter::Info,
            Ok(6..=7) => LevelFilter::Debug,
            Ok(_) => LevelFilter::Trace,
            Err(_) => {
                return Err(WafError::Config(format!(
                    "unknown verbosity {value:?} (expected error, warning, notice, info, debug, trace, or 0-9)"
                )));
            }
        },
    };
    Ok(level)
}
