use std::time::Duration;

use bucket_storage::WaitArgs;
use clap::Parser;

use crate::{
    controller::ControllerOptions,
    queue::RateLimiterConfig,
    reconciler::DEFAULT_MAX_RETRIES,
};

#[derive(Clone, Debug, PartialEq, Parser)]
pub struct OperatorArgs {
    /// Number of concurrent reconciliation workers
    #[arg(long, env = "BUCKET_WORKERS", value_name = "COUNT", default_value_t = 1)]
    pub workers: usize,

    /// Retries of a failing item before it is dropped
    #[arg(
        long,
        env = "BUCKET_MAX_RETRIES",
        value_name = "COUNT",
        default_value_t = DEFAULT_MAX_RETRIES,
    )]
    pub max_retries: usize,

    /// Watch a single namespace instead of the whole cluster
    #[arg(long, env = "BUCKET_NAMESPACE", value_name = "NAMESPACE")]
    pub namespace: Option<String>,

    /// Re-deliver every cached bucket periodically (0 disables it)
    #[arg(
        long,
        env = "BUCKET_RESYNC_PERIOD_MS",
        value_name = "MS",
        default_value_t = 0
    )]
    pub resync_period_ms: u64,

    /// Give up if the initial list does not complete in time (0 waits forever)
    #[arg(
        long,
        env = "BUCKET_SYNC_TIMEOUT_MS",
        value_name = "MS",
        default_value_t = 0
    )]
    pub sync_timeout_ms: u64,

    /// Create or update the Bucket CRD before watching
    #[arg(long, env = "BUCKET_INSTALL_CRD")]
    pub install_crd: bool,

    #[command(flatten)]
    pub rate_limit: RateLimitArgs,

    #[command(flatten)]
    pub wait: WaitArgs,
}

impl OperatorArgs {
    pub fn resync_period(&self) -> Option<Duration> {
        non_zero_millis(self.resync_period_ms)
    }

    pub fn sync_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.sync_timeout_ms)
    }

    pub fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            workers: self.workers.max(1),
            max_retries: self.max_retries,
            sync_timeout: self.sync_timeout(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Parser)]
pub struct RateLimitArgs {
    #[arg(long, env = "BUCKET_BACKOFF_BASE_MS", value_name = "MS", default_value_t = 5)]
    pub backoff_base_ms: u64,

    #[arg(
        long,
        env = "BUCKET_BACKOFF_MAX_MS",
        value_name = "MS",
        default_value_t = 1_000_000
    )]
    pub backoff_max_ms: u64,

    #[arg(long, env = "BUCKET_RATE_LIMIT_QPS", value_name = "QPS", default_value_t = 10.0)]
    pub rate_limit_qps: f64,

    #[arg(
        long,
        env = "BUCKET_RATE_LIMIT_BURST",
        value_name = "COUNT",
        default_value_t = 100
    )]
    pub rate_limit_burst: u32,
}

impl From<&RateLimitArgs> for RateLimiterConfig {
    fn from(args: &RateLimitArgs) -> Self {
        Self {
            base_delay: Duration::from_millis(args.backoff_base_ms),
            max_delay: Duration::from_millis(args.backoff_max_ms),
            qps: args.rate_limit_qps,
            burst: args.rate_limit_burst,
        }
    }
}

fn non_zero_millis(ms: u64) -> Option<Duration> {
    Some(Duration::from_millis(ms)).filter(|duration| !duration.is_zero())
}
