use clap::{Arg, ArgAction, ArgMatches, Command, value_parser};
use gcp_provider_core::config::IdentityBinding;
use gcp_provider_core::{ProviderConfig, config::RUNTIME_NAME};
use std::path::PathBuf;
use std::time::Duration;

pub(super) fn root_cli() -> Command {
    Command::new(RUNTIME_NAME)
        .about("Secrets Store CSI driver provider for Google Secret Manager")
        .version(env!("PROVIDER_VERSION"))
        .arg(
            Arg::new("kubeconfig")
                .long("kubeconfig")
                .value_parser(value_parser!(PathBuf))
                .help("Path to a kubeconfig, the in-cluster configuration is used when unset"),
        )
        .arg(
            Arg::new("log-format-json")
                .long("log-format-json")
                .value_parser(value_parser!(bool))
                .num_args(0..=1)
                .default_value("true")
                .default_missing_value("true")
                .action(ArgAction::Set)
                .help("Log as flattened JSON, plain text otherwise"),
        )
        .arg(
            Arg::new("mount-timeout-secs")
                .long("mount-timeout-secs")
                .value_parser(value_parser!(u64).range(1..))
                .default_value("30")
                .help("Upper bound of a single Mount call"),
        )
        .arg(
            Arg::new("drain-timeout-secs")
                .long("drain-timeout-secs")
                .value_parser(value_parser!(u64))
                .default_value("30")
                .help("How long in-flight calls may run after a shutdown signal"),
        )
        .arg(
            Arg::new("max-concurrent-fetches")
                .long("max-concurrent-fetches")
                .value_parser(value_parser!(u16).range(1..))
                .default_value("8")
                .help("Concurrent Secret Manager calls per Mount call"),
        )
        .arg(
            Arg::new("identity-pool")
                .long("identity-pool")
                .requires("identity-provider")
                .help("Workload identity pool, discovered from the metadata server when unset"),
        )
        .arg(
            Arg::new("identity-provider")
                .long("identity-provider")
                .requires("identity-pool")
                .help("Workload identity provider of the cluster"),
        )
}

/// The command line on top of the environment based [`ProviderConfig`].
#[derive(Debug, Clone, PartialEq)]
pub(super) struct Args {
    pub(super) kubeconfig: Option<PathBuf>,
    pub(super) log_format_json: bool,
    pub(super) mount_timeout: Duration,
    pub(super) drain_timeout: Duration,
    pub(super) max_concurrent_fetches: usize,
    pub(super) identity_binding: Option<IdentityBinding>,
}

impl From<&ArgMatches> for Args {
    fn from(matches: &ArgMatches) -> Self {
        let identity_binding = match (
            matches.get_one::<String>("identity-pool"),
            matches.get_one::<String>("identity-provider"),
        ) {
            (Some(pool), Some(provider)) => Some(IdentityBinding {
                pool: pool.clone(),
                provider: provider.clone(),
            }),
            _ => None,
        };

        Self {
            kubeconfig: matches.get_one::<PathBuf>("kubeconfig").cloned(),
            log_format_json: matches
                .get_one::<bool>("log-format-json")
                .copied()
                .unwrap_or(true),
            mount_timeout: Duration::from_secs(
                matches
                    .get_one::<u64>("mount-timeout-secs")
                    .copied()
                    .unwrap_or(30),
            ),
            drain_timeout: Duration::from_secs(
                matches
                    .get_one::<u64>("drain-timeout-secs")
                    .copied()
                    .unwrap_or(30),
            ),
            max_concurrent_fetches: matches
                .get_one::<u16>("max-concurrent-fetches")
                .copied()
                .map(usize::from)
                .unwrap_or(8),
            identity_binding,
        }
    }
}

impl Args {
    pub(super) fn apply(self, config: &mut ProviderConfig) {
        config.kubeconfig = self.kubeconfig;
        config.mount_timeout = self.mount_timeout;
        config.drain_timeout = self.drain_timeout;
        config.max_concurrent_fetches = self.max_concurrent_fetches;
        config.identity_binding = self.identity_binding;
    }
}
