use std::time::Duration;

use aws_config::BehaviorVersion;
use aws_config::meta::region::RegionProviderChain;
use aws_config::retry::RetryConfig;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Builder;
use aws_smithy_runtime_api::client::stalled_stream_protection::StalledStreamProtectionConfig;
use aws_smithy_types::timeout::TimeoutConfig;
use aws_types::region::Region;

use crate::config::Config;

const FALLBACK_REGION: &str = "us-east-1";

/// Builds the single shared S3 client. The engine performs its own
/// retry/resume handling, so SDK-level retries are disabled and stalled
/// streams surface after the configured inactivity window.
pub async fn create_client(config: &Config) -> Client {
    let credentials = aws_sdk_s3::config::Credentials::new(
        config.credentials.access_key.clone(),
        config.credentials.secret_key.clone(),
        None,
        None,
        "sfs3",
    );

    let region_provider =
        RegionProviderChain::first_try(config.region.clone().map(Region::new))
            .or_default_provider()
            .or_else(Region::new(FALLBACK_REGION));

    let mut config_loader = aws_config::defaults(BehaviorVersion::latest())
        .credentials_provider(credentials)
        .region(region_provider)
        .retry_config(RetryConfig::disabled())
        .stalled_stream_protection(
            StalledStreamProtectionConfig::enabled()
                .grace_period(Duration::from_secs(
                    config.timeout_config.stall_timeout_seconds,
                ))
                .build(),
        );

    if let Some(endpoint_url) = &config.endpoint_url {
        config_loader = config_loader.endpoint_url(endpoint_url);
    } else if !config.ssl {
        config_loader = config_loader.endpoint_url("http://s3.amazonaws.com");
    }

    let sdk_config = config_loader.load().await;

    let config_builder = Builder::from(&sdk_config)
        .force_path_style(config.force_path_style)
        .timeout_config(
            TimeoutConfig::builder()
                .connect_timeout(Duration::from_secs(
                    config.timeout_config.operation_timeout_seconds,
                ))
                .build(),
        );

    Client::from_conf(config_builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::args::{EnvSettings, build_config, parse_from_args};
    use crate::config::ConfFile;

    fn test_config(endpoint_url: Option<&str>, ssl: bool) -> Config {
        let args = parse_from_args(vec!["sfs3", "ls"]).unwrap();
        let conf = ConfFile {
            access_key: Some("my_access_key".to_string()),
            secret_key: Some("my_secret_key".to_string()),
            bucket: Some("my-bucket".to_string()),
            ssl: Some(ssl),
            region: Some("my-region".to_string()),
            endpoint_url: endpoint_url.map(str::to_string),
            ..Default::default()
        };
        build_config(&args, conf, EnvSettings::default()).unwrap()
    }

    #[tokio::test]
    async fn create_client_with_explicit_region() {
        init_dummy_tracing_subscriber();

        let client = create_client(&test_config(None, true)).await;

        assert_eq!(
            client.config().region().unwrap().to_string(),
            "my-region".to_string()
        );
        assert_eq!(client.config().retry_config().unwrap().max_attempts(), 1);
    }

    #[tokio::test]
    async fn create_client_with_custom_endpoint_uses_path_style() {
        init_dummy_tracing_subscriber();

        let config = test_config(Some("http://localhost:9000"), true);
        assert!(config.force_path_style);

        let client = create_client(&config).await;
        assert_eq!(
            client.config().endpoint_url(),
            Some("http://localhost:9000")
        );
    }

    #[tokio::test]
    async fn create_client_without_ssl_points_at_http_endpoint() {
        init_dummy_tracing_subscriber();

        let client = create_client(&test_config(None, false)).await;
        assert_eq!(
            client.config().endpoint_url(),
            Some("http://s3.amazonaws.com")
        );
    }

    fn init_dummy_tracing_subscriber() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("dummy=trace")
            .try_init();
    }
}
