//! Configuration recognised by the core (spec §6), and its validation.
//!
//! Credential/endpoint resolution for the concrete object-store client stays
//! genuinely external (spec §1); this module owns only the parameters the
//! four subsystems themselves consume.

use std::time::Duration;

const MIN_LEASE_DURATION: Duration = Duration::from_secs(15);
const MAX_LEASE_DURATION: Duration = Duration::from_secs(60);

/// Which state-tracker variant to use (spec §4.3).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackingStrategy {
    /// Index tags on the blob itself.
    Tags,
    /// Move blobs between incoming/archive/errors containers.
    Container,
    /// A local embedded registry; single-replica only.
    Registry,
}

impl std::str::FromStr for TrackingStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tags" => Ok(Self::Tags),
            "container" => Ok(Self::Container),
            "registry" => Ok(Self::Registry),
            other => Err(ConfigError::UnknownStrategy(other.to_string())),
        }
    }
}

/// Container names used by the container-move tracker (spec §4.3.B).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContainerNames {
    /// Where newly-arrived blobs are discovered.
    pub incoming: String,
    /// Where successfully processed blobs are moved.
    pub archive: String,
    /// Where blobs that failed processing are moved.
    pub errors: String,
}

/// Every parameter the core's four subsystems consume (spec §6).
#[derive(Clone, Debug)]
pub struct Config {
    /// Which tracker variant to run.
    pub strategy: TrackingStrategy,
    /// Lease lifetime requested on `acquire` (15-60s).
    pub lease_duration: Duration,
    /// Renewal period; must be less than `lease_duration`.
    pub lease_renewal: Duration,
    /// Maximum claimed blobs per cycle (Phase 1 cap).
    pub blob_batch_size: usize,
    /// Worker-pool size for Phase 2.
    pub concurrency: usize,
    /// Optional listing prefix.
    pub prefix: Option<String>,
    /// Whether empty lines are skipped by the streamer.
    pub skip_empty_lines: bool,
    /// Identifier of this replica, written to `processor` fields.
    pub processor: String,
    /// Container the tag and registry strategies poll for new blobs.
    pub incoming_container: String,
    /// Path to the local registry's database file (registry strategy only).
    pub registry_path: Option<String>,
    /// Container names for the container-move strategy.
    pub containers: Option<ContainerNames>,
}

/// Reasons a [`Config`] is rejected at startup (spec §6, §7 "Configuration
/// error").
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `strategy` was not one of `tags`, `container`, `registry`.
    #[error("unknown tracking strategy {0:?} (expected tags, container, or registry)")]
    UnknownStrategy(String),

    /// `lease_duration` fell outside the 15-60s range.
    #[error("lease_duration must be between 15s and 60s, got {0:?}")]
    LeaseDurationOutOfRange(Duration),

    /// `lease_renewal` was not strictly less than `lease_duration`.
    #[error("lease_renewal ({renewal:?}) must be less than lease_duration ({duration:?})")]
    RenewalNotLessThanDuration {
        /// The configured renewal period.
        renewal: Duration,
        /// The configured lease duration.
        duration: Duration,
    },

    /// `blob_batch_size` was zero.
    #[error("blob_batch_size must be at least 1")]
    BatchSizeZero,

    /// `concurrency` was zero.
    #[error("concurrency must be at least 1")]
    ConcurrencyZero,

    /// The container strategy was selected without container names.
    #[error("the container strategy requires incoming/archive/errors container names")]
    MissingContainerNames,

    /// The registry strategy was selected without a database path.
    #[error("the registry strategy requires a registry_path")]
    MissingRegistryPath,
}

impl Config {
    /// Validates the configuration per spec §6: unknown enums, missing
    /// required parameters for the chosen strategy, and out-of-range lease
    /// parameters are rejected here — everything else (credentials,
    /// endpoints) is genuinely external.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lease_duration < MIN_LEASE_DURATION || self.lease_duration > MAX_LEASE_DURATION {
            return Err(ConfigError::LeaseDurationOutOfRange(self.lease_duration));
        }
        if self.lease_renewal >= self.lease_duration {
            return Err(ConfigError::RenewalNotLessThanDuration {
                renewal: self.lease_renewal,
                duration: self.lease_duration,
            });
        }
        if self.blob_batch_size == 0 {
            return Err(ConfigError::BatchSizeZero);
        }
        if self.concurrency == 0 {
            return Err(ConfigError::ConcurrencyZero);
        }

        match self.strategy {
            TrackingStrategy::Container => {
                let names = self.containers.as_ref().ok_or(ConfigError::MissingContainerNames)?;
                if names.incoming.is_empty() || names.archive.is_empty() || names.errors.is_empty() {
                    return Err(ConfigError::MissingContainerNames);
                }
            }
            TrackingStrategy::Registry => {
                if self.registry_path.as_deref().is_none_or_empty() {
                    return Err(ConfigError::MissingRegistryPath);
                }
            }
            TrackingStrategy::Tags => {}
        }

        Ok(())
    }
}

/// Small helper so `validate` reads naturally; avoids pulling in an extra
/// crate just for "is this `Option<&str>` absent or empty".
trait OptionStrExt {
    fn is_none_or_empty(&self) -> bool;
}

impl OptionStrExt for Option<&str> {
    fn is_none_or_empty(&self) -> bool {
        match self {
            None => true,
            Some(s) => s.is_empty(),
        }
    }
}

/// Command-line configuration, mirroring how `clap::Parser`-derived
/// `ClientArgs` sits alongside the plain `Config` in the teacher crate.
#[cfg(feature = "clap")]
#[derive(Clone, Debug, clap::Parser)]
pub struct Args {
    /// Tracking strategy: tags, container, or registry.
    #[arg(long, default_value = "tags")]
    pub strategy: String,

    /// Lease duration in seconds (15-60).
    #[arg(long, default_value_t = 30)]
    pub lease_duration_secs: u64,

    /// Lease renewal period in seconds.
    #[arg(long, default_value_t = 20)]
    pub lease_renewal_secs: u64,

    /// Maximum blobs claimed per cycle.
    #[arg(long, default_value_t = 1000)]
    pub blob_batch_size: usize,

    /// Worker-pool size.
    #[arg(long, default_value_t = 4)]
    pub concurrency: usize,

    /// Optional listing prefix.
    #[arg(long)]
    pub prefix: Option<String>,

    /// Skip empty lines.
    #[arg(long)]
    pub skip_empty_lines: bool,

    /// Processor identifier (defaults to hostname by convention; left to the
    /// caller to resolve — out of scope here).
    #[arg(long)]
    pub processor: String,

    /// Container polled for new blobs.
    #[arg(long)]
    pub incoming_container: String,

    /// Registry database path (registry strategy only).
    #[arg(long)]
    pub registry_path: Option<String>,

    /// Archive container (container strategy only).
    #[arg(long)]
    pub archive_container: Option<String>,

    /// Errors container (container strategy only).
    #[arg(long)]
    pub errors_container: Option<String>,
}

#[cfg(feature = "clap")]
impl TryFrom<Args> for Config {
    type Error = ConfigError;

    fn try_from(args: Args) -> Result<Self, Self::Error> {
        let strategy: TrackingStrategy = args.strategy.parse()?;
        let containers = match (args.archive_container, args.errors_container) {
            (Some(archive), Some(errors)) => Some(ContainerNames {
                incoming: args.incoming_container.clone(),
                archive,
                errors,
            }),
            _ => None,
        };

        let config = Config {
            strategy,
            lease_duration: Duration::from_secs(args.lease_duration_secs),
            lease_renewal: Duration::from_secs(args.lease_renewal_secs),
            blob_batch_size: args.blob_batch_size,
            concurrency: args.concurrency,
            prefix: args.prefix,
            skip_empty_lines: args.skip_empty_lines,
            processor: args.processor,
            incoming_container: args.incoming_container,
            registry_path: args.registry_path,
            containers,
        };
        config.validate()?;
        Ok(config)
    }
}
