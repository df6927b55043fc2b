// datafetch-notify - completion notifications for downstream consumers
//
// Bundle completions are published to an external bus (SQS). Delivery is
// at-least-once: the storage pipeline keeps a durable pending record around
// each publish attempt, so consumers must deduplicate by bundle_id.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info};

use datafetch_core::{BundleRef, FetchError, Result};

/// Publisher of bundle-completion events.
#[async_trait]
pub trait CompletionPublisher: Send + Sync {
    /// Emit one completion message. Failures propagate so the caller's
    /// pending record survives for a later retry.
    async fn publish_bundle_completion(
        &self,
        bundle_ref: &BundleRef,
        metadata: &Value,
        recipe_id: &str,
    ) -> Result<()>;
}

/// Build the completion message body shared by all publishers.
pub fn completion_message(bundle_ref: &BundleRef, metadata: &Value, recipe_id: &str) -> Value {
    json!({
        "bundle_id": bundle_ref.bid.as_str(),
        "recipe_id": recipe_id,
        "primary_url": &bundle_ref.primary_url,
        "resources_count": bundle_ref.resources_count,
        "storage_key": &bundle_ref.storage_key,
        "completion_timestamp": Utc::now().to_rfc3339(),
        "metadata": metadata,
    })
}

/// SQS-backed publisher.
pub struct SqsPublisher {
    client: aws_sdk_sqs::Client,
    queue_url: String,
}

impl SqsPublisher {
    pub async fn new(queue_url: impl Into<String>, region: Option<String>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region));
        }
        let config = loader.load().await;
        SqsPublisher {
            client: aws_sdk_sqs::Client::new(&config),
            queue_url: queue_url.into(),
        }
    }

    /// Publisher against a custom endpoint (LocalStack and friends).
    pub async fn with_endpoint(
        queue_url: impl Into<String>,
        region: Option<String>,
        endpoint_url: impl Into<String>,
    ) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .endpoint_url(endpoint_url.into());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region));
        }
        let config = loader.load().await;
        SqsPublisher {
            client: aws_sdk_sqs::Client::new(&config),
            queue_url: queue_url.into(),
        }
    }

    fn string_attribute(
        value: &str,
    ) -> Result<aws_sdk_sqs::types::MessageAttributeValue> {
        aws_sdk_sqs::types::MessageAttributeValue::builder()
            .data_type("String")
            .string_value(value)
            .build()
            .map_err(|e| FetchError::network_from("invalid SQS message attribute", e))
    }
}

#[async_trait]
impl CompletionPublisher for SqsPublisher {
    async fn publish_bundle_completion(
        &self,
        bundle_ref: &BundleRef,
        metadata: &Value,
        recipe_id: &str,
    ) -> Result<()> {
        let message = completion_message(bundle_ref, metadata, recipe_id);
        let timestamp = message["completion_timestamp"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let body = serde_json::to_string(&message)
            .map_err(|e| FetchError::network_from("completion message encoding failed", e))?;

        debug!(bundle_id = %bundle_ref.bid, recipe_id, "SQS_PUBLISH_STARTING");

        self.client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .message_attributes("bundle_id", Self::string_attribute(bundle_ref.bid.as_str())?)
            .message_attributes("recipe_id", Self::string_attribute(recipe_id)?)
            .message_attributes("completion_timestamp", Self::string_attribute(&timestamp)?)
            .send()
            .await
            .map_err(|e| {
                FetchError::network_from(
                    format!("SQS publish failed for bundle {}", bundle_ref.bid),
                    e,
                )
            })?;

        info!(bundle_id = %bundle_ref.bid, recipe_id, "SQS_PUBLISH_COMPLETED");
        Ok(())
    }
}

/// Dev-mode publisher that only logs completions.
#[derive(Debug, Default)]
pub struct LoggingPublisher;

#[async_trait]
impl CompletionPublisher for LoggingPublisher {
    async fn publish_bundle_completion(
        &self,
        bundle_ref: &BundleRef,
        metadata: &Value,
        recipe_id: &str,
    ) -> Result<()> {
        let message = completion_message(bundle_ref, metadata, recipe_id);
        info!(
            bundle_id = %bundle_ref.bid,
            recipe_id,
            message = %message,
            "BUNDLE_COMPLETION_LOGGED"
        );
        Ok(())
    }
}
