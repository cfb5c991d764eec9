use std::sync::Arc;

use anyhow::Result;
use bucket_api::bucket::BucketCrd;
use bucket_core::{signal::ShutdownSignal, tracer};
use bucket_operator::{
    args::OperatorArgs, cache::KubeWatchCache, consts::NAME, controller::Controller,
    lifecycle::BucketLifecycle,
    queue::{RateLimiterConfig, WorkQueue},
};
use bucket_storage::s3::{S3Storage, StorageS3Args};
use clap::Parser;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::{Patch, PatchParams, PostParams},
    Api, Client, CustomResourceExt, ResourceExt,
};
use tracing::{info, instrument, Level};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    operator: OperatorArgs,

    #[command(flatten)]
    s3: StorageS3Args,
}

#[instrument(level = Level::INFO, skip_all, err(Display))]
async fn install_crd(client: Client) -> Result<()> {
    let api = Api::<CustomResourceDefinition>::all(client);
    let crd = BucketCrd::crd();
    let name = crd.name_any();

    if api.get_opt(&name).await?.is_none() {
        let pp = PostParams {
            dry_run: false,
            field_manager: Some(NAME.into()),
        };
        api.create(&pp, &crd).await?;
        info!("Created CRD: {name}");
    } else {
        let pp = PatchParams {
            dry_run: false,
            force: true,
            field_manager: Some(NAME.into()),
            ..Default::default()
        };
        api.patch(&name, &pp, &Patch::Apply(&crd)).await?;
        info!("Updated CRD: {name}");
    }
    Ok(())
}

async fn try_main(args: Args) -> Result<()> {
    let Args { operator, s3 } = args;

    let signal = ShutdownSignal::default();
    signal.trap_on_sigint()?;

    let client = Client::try_default().await?;
    if operator.install_crd {
        install_crd(client.clone()).await?;
    }

    let storage = S3Storage::try_new(&s3, &operator.wait)?;
    let handler = Arc::new(BucketLifecycle::new(storage, operator.wait.timeout()));

    let api = match operator.namespace.as_deref() {
        Some(namespace) => Api::<BucketCrd>::namespaced(client, namespace),
        None => Api::<BucketCrd>::all(client),
    };
    let cache = Arc::new(KubeWatchCache::new(api, operator.resync_period()));
    let rate_limiter = RateLimiterConfig::from(&operator.rate_limit).build();
    let queue = Arc::new(WorkQueue::new(rate_limiter));

    let controller = Controller::new(cache, handler, queue, operator.controller_options()).await;
    controller.run(signal).await.map_err(Into::into)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracer::try_init_once()?;

    try_main(args).await
}
