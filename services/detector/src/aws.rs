use crate::config::AwsConfig;
use aws_config::timeout::TimeoutConfig;
use aws_config::BehaviorVersion;
use aws_types::region::Region;
use aws_types::SdkConfig;
use tracing::info;

/// Load the SDK configuration shared by the Rekognition, SNS and SQS clients
pub async fn load_sdk_config(config: &AwsConfig) -> SdkConfig {
    let timeouts = TimeoutConfig::builder()
        .operation_timeout(config.operation_timeout())
        .operation_attempt_timeout(config.attempt_timeout())
        .build();

    let mut loader = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(config.region.clone()))
        .timeout_config(timeouts);

    if let Some(ref endpoint) = config.endpoint_url {
        info!(endpoint = %endpoint, "Using custom AWS endpoint");
        loader = loader.endpoint_url(endpoint);
    }

    loader.load().await
}
