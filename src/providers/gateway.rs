use crate::calendar::MonthKey;
use crate::error::AppError;
use crate::providers::{
    AccountBill, CloudProvider, DescribeMetricListRequest, InstanceBill, InstanceDetail,
    MetricSample, Operation, Provider, QueryAccountBillRequest, Region,
};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;
use url::Url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
    pub region_id: String,
}

/// Talks to a billing gateway that fronts the vendor SDKs with one JSON
/// endpoint per operation: `POST {endpoint}/{provider}/{operation}`.
pub struct GatewayProvider {
    provider: CloudProvider,
    base: Url,
    credentials: Credentials,
    client: Client,
}

impl GatewayProvider {
    pub fn new(
        provider: CloudProvider,
        endpoint: &str,
        credentials: Credentials,
    ) -> Result<Self, AppError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            provider,
            base: normalize_base(endpoint)?,
            credentials,
            client,
        })
    }

    fn operation_url(&self, operation: Operation) -> Result<Url, AppError> {
        self.base
            .join(&format!("{}/{}", self.provider.as_str(), operation.as_str()))
            .map_err(|err| AppError::Config(format!("invalid gateway url: {err}")))
    }

    async fn call<B, T>(&self, operation: Operation, body: &B) -> Result<T, AppError>
    where
        B: Serialize + Sync,
        T: DeserializeOwned + Send,
    {
        let url = self.operation_url(operation)?;
        debug!(provider = %self.provider, operation = operation.as_str(), %url, "gateway call");

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.credentials.secret_key)
            .header("X-Access-Key", &self.credentials.access_key)
            .header("X-Region-Id", &self.credentials.region_id)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AppError::Upstream {
                provider: self.provider.to_string(),
                operation: operation.as_str(),
                message: format!("HTTP {}: {}", status.as_u16(), message.trim()),
            });
        }
        Ok(response.json().await?)
    }
}

/// Parses the configured endpoint and makes sure relative joins append to
/// its path instead of replacing the last segment.
fn normalize_base(endpoint: &str) -> Result<Url, AppError> {
    let mut base = Url::parse(endpoint.trim())
        .map_err(|err| AppError::Config(format!("invalid gateway endpoint '{endpoint}': {err}")))?;
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    Ok(base)
}

#[async_trait]
impl Provider for GatewayProvider {
    fn provider_type(&self) -> CloudProvider {
        self.provider
    }

    async fn query_account_bill(
        &self,
        request: &QueryAccountBillRequest,
    ) -> Result<AccountBill, AppError> {
        self.call(Operation::QueryAccountBill, request).await
    }

    async fn describe_metric_list(
        &self,
        request: &DescribeMetricListRequest,
    ) -> Result<Vec<MetricSample>, AppError> {
        self.call(Operation::DescribeMetricList, request).await
    }

    async fn describe_regions(&self) -> Result<Vec<Region>, AppError> {
        self.call(Operation::DescribeRegions, &json!({})).await
    }

    async fn query_available_instances(
        &self,
        region_id: &str,
    ) -> Result<Vec<InstanceDetail>, AppError> {
        self.call(
            Operation::QueryAvailableInstances,
            &json!({ "region_id": region_id }),
        )
        .await
    }

    async fn describe_instances(
        &self,
        instance_ids: &[String],
    ) -> Result<Vec<InstanceDetail>, AppError> {
        self.call(
            Operation::DescribeInstances,
            &json!({ "instance_ids": instance_ids }),
        )
        .await
    }

    async fn describe_instance_bill(
        &self,
        billing_cycle: MonthKey,
        instance_id: Option<&str>,
    ) -> Result<Vec<InstanceBill>, AppError> {
        self.call(
            Operation::DescribeInstanceBill,
            &json!({ "billing_cycle": billing_cycle, "instance_id": instance_id }),
        )
        .await
    }
}
