use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use clap::Parser;
use futures::{stream, StreamExt, TryStreamExt};
use minio::s3::{
    args::{BucketExistsArgs, MakeBucketArgs, RemoveBucketArgs},
    client::Client,
    creds::StaticProvider,
    error::Error,
    http::BaseUrl,
    types::S3Api,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, Level};
use url::Url;

use crate::{BucketState, ObjectPage, ObjectStorage, Result, StorageError, WaitArgs};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Parser)]
pub struct StorageS3Args {
    #[arg(long, env = "AWS_ACCESS_KEY_ID", value_name = "VALUE")]
    pub access_key: String,

    #[arg(
        long,
        env = "AWS_REGION",
        value_name = "REGION",
        default_value = "us-east-1"
    )]
    pub region: String,

    #[arg(long, env = "AWS_ENDPOINT_URL", value_name = "URL")]
    pub s3_endpoint: Url,

    #[arg(long, env = "AWS_SECRET_ACCESS_KEY", value_name = "VALUE")]
    pub secret_key: String,
}

pub struct S3Storage {
    client: Client,
    endpoint: Url,
    poll_interval: Duration,
    region: String,
}

impl S3Storage {
    /// Upper bound of in-flight object removals per purged page.
    const DELETE_CONCURRENCY: usize = 64;

    #[instrument(level = Level::INFO, skip_all, err(Display))]
    pub fn try_new(
        StorageS3Args {
            access_key,
            region,
            s3_endpoint,
            secret_key,
        }: &StorageS3Args,
        wait: &WaitArgs,
    ) -> ::anyhow::Result<Self> {
        debug!("Initializing S3 storage client ({s3_endpoint})");

        let base_url: BaseUrl = s3_endpoint
            .as_str()
            .parse()
            .map_err(|error| anyhow!("failed to parse s3 storage endpoint: {error}"))?;
        let provider = StaticProvider::new(access_key, secret_key, None);
        let ssl_cert_file = None;
        let ignore_cert_check = Some(!base_url.https);

        Ok(Self {
            client: Client::new(
                base_url,
                Some(Box::new(provider)),
                ssl_cert_file,
                ignore_cert_check,
            )?,
            endpoint: s3_endpoint.clone(),
            poll_interval: wait.interval(),
            region: region.clone(),
        })
    }
}

#[async_trait]
impl ObjectStorage for S3Storage {
    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    #[instrument(level = Level::INFO, skip(self), fields(endpoint = %self.endpoint), err(Display))]
    async fn head_bucket(&self, name: &str) -> Result<BucketState> {
        let args = BucketExistsArgs::new(name).map_err(|error| classify(name, error))?;
        match self.client.bucket_exists(&args).await {
            Ok(true) => Ok(BucketState::Exists),
            Ok(false) => Ok(BucketState::NotFound),
            Err(error) => match classify(name, error) {
                StorageError::NoSuchBucket(_) => Ok(BucketState::NotFound),
                error => Err(error),
            },
        }
    }

    #[instrument(level = Level::INFO, skip(self), fields(endpoint = %self.endpoint), err(Display))]
    async fn create_bucket(&self, name: &str, region: Option<&str>) -> Result<()> {
        let mut args = MakeBucketArgs::new(name).map_err(|error| classify(name, error))?;
        args.region = Some(region.unwrap_or(&self.region));

        self.client
            .make_bucket(&args)
            .await
            .map(|response| info!("created a bucket: {}", response.bucket_name))
            .map_err(|error| classify(name, error))
    }

    #[instrument(level = Level::INFO, skip(self), fields(endpoint = %self.endpoint), err(Display))]
    async fn list_objects(
        &self,
        name: &str,
        continuation_token: Option<String>,
    ) -> Result<ObjectPage> {
        let response = self
            .client
            .list_objects_v2(name)
            .continuation_token(continuation_token)
            .send()
            .await
            .map_err(|error| classify(name, error))?;

        Ok(ObjectPage {
            keys: response
                .contents
                .into_iter()
                .map(|item| item.name)
                .collect(),
            is_truncated: response.is_truncated,
            next_continuation_token: response.next_continuation_token,
        })
    }

    #[instrument(level = Level::INFO, skip(self, keys), fields(endpoint = %self.endpoint, keys = keys.len()), err(Display))]
    async fn delete_objects(&self, name: &str, keys: Vec<String>) -> Result<()> {
        stream::iter(keys)
            .map(|key| async move {
                self.client
                    .remove_object(name, key.as_str())
                    .send()
                    .await
                    .map(|_| ())
                    .map_err(|error| classify(name, error))
            })
            .buffer_unordered(Self::DELETE_CONCURRENCY)
            .try_collect()
            .await
    }

    #[instrument(level = Level::INFO, skip(self), fields(endpoint = %self.endpoint), err(Display))]
    async fn delete_bucket(&self, name: &str) -> Result<()> {
        let args = RemoveBucketArgs::new(name).map_err(|error| classify(name, error))?;
        self.client
            .remove_bucket(&args)
            .await
            .map(|_| ())
            .map_err(|error| classify(name, error))
    }
}

fn classify(bucket: &str, error: Error) -> StorageError {
    match &error {
        Error::InvalidBucketName(_) => StorageError::InvalidBucketName(bucket.into()),
        Error::S3Error(response) => match response.code.as_str() {
            "NoSuchBucket" => StorageError::NoSuchBucket(bucket.into()),
            "BucketAlreadyOwnedByYou" => StorageError::AlreadyOwnedByYou(bucket.into()),
            "BucketAlreadyExists" => StorageError::AlreadyExists(bucket.into()),
            "AccessDenied" | "AllAccessDisabled" | "InvalidAccessKeyId"
            | "SignatureDoesNotMatch" => StorageError::AccessDenied {
                code: response.code.clone(),
                message: error.to_string(),
            },
            _ => StorageError::Request(anyhow!("{bucket}: {error}")),
        },
        _ => StorageError::Request(anyhow!("{bucket}: {error}")),
    }
}
