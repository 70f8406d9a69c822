//! AWS client construction from endpoint configuration.

use aws_config::{BehaviorVersion, Region, SdkConfig};
use s3_migrate::EndpointConfig;

/// Shared config for the worker-side services (queue, ledger), using
/// the ambient credentials and region.
pub async fn ambient_config() -> SdkConfig {
    aws_config::load_defaults(BehaviorVersion::latest()).await
}

/// S3 client for one side of the transfer. Each side can carry its own
/// profile, region and endpoint, so cross-account and cross-provider
/// setups need no shared credential chain.
pub async fn s3_client(endpoint: &EndpointConfig) -> aws_sdk_s3::Client {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(profile) = &endpoint.profile {
        loader = loader.profile_name(profile);
    }
    if let Some(region) = &endpoint.region {
        loader = loader.region(Region::new(region.clone()));
    }
    let shared = loader.load().await;

    let mut builder = aws_sdk_s3::config::Builder::from(&shared);
    if let Some(url) = &endpoint.endpoint {
        // S3-compatible endpoints rarely support virtual-hosted buckets.
        builder = builder.endpoint_url(url).force_path_style(true);
    }
    aws_sdk_s3::Client::from_conf(builder.build())
}

pub fn sqs_client(config: &SdkConfig) -> aws_sdk_sqs::Client {
    aws_sdk_sqs::Client::new(config)
}

pub fn dynamodb_client(config: &SdkConfig) -> aws_sdk_dynamodb::Client {
    aws_sdk_dynamodb::Client::new(config)
}
