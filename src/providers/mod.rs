use crate::calendar::{Granularity, MonthKey, PeriodKey};
use crate::config::CloudAccount;
use crate::error::AppError;
use crate::models::SubscriptionType;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub mod fixture;
pub mod gateway;
#[cfg(test)]
pub mod testing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CloudProvider {
    #[serde(rename = "AlibabaCloud")]
    Alibaba,
    #[serde(rename = "HuaweiCloud")]
    Huawei,
    #[serde(rename = "TencentCloud")]
    Tencent,
    #[serde(rename = "AWSCloud")]
    Aws,
    #[serde(rename = "BaiduCloud")]
    Baidu,
}

impl CloudProvider {
    pub const ALL: [CloudProvider; 5] = [
        CloudProvider::Alibaba,
        CloudProvider::Huawei,
        CloudProvider::Tencent,
        CloudProvider::Aws,
        CloudProvider::Baidu,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CloudProvider::Alibaba => "AlibabaCloud",
            CloudProvider::Huawei => "HuaweiCloud",
            CloudProvider::Tencent => "TencentCloud",
            CloudProvider::Aws => "AWSCloud",
            CloudProvider::Baidu => "BaiduCloud",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            CloudProvider::Alibaba => "Alibaba Cloud",
            CloudProvider::Huawei => "Huawei Cloud",
            CloudProvider::Tencent => "Tencent Cloud",
            CloudProvider::Aws => "AWS",
            CloudProvider::Baidu => "Baidu Cloud",
        }
    }

    /// Providers whose metric API needs explicit instance ids, so the
    /// inventory has to be listed before utilization can be fetched.
    pub fn needs_instance_inventory(self) -> bool {
        self != CloudProvider::Alibaba
    }
}

impl fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CloudProvider {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        CloudProvider::ALL
            .into_iter()
            .find(|p| {
                p.as_str().eq_ignore_ascii_case(&normalized)
                    || p.as_str().to_ascii_lowercase().trim_end_matches("cloud") == normalized
            })
            .ok_or_else(|| AppError::Config(format!("invalid provider '{}'", raw.trim())))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    QueryAccountBill,
    DescribeMetricList,
    DescribeRegions,
    QueryAvailableInstances,
    DescribeInstances,
    DescribeInstanceBill,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::QueryAccountBill => "QueryAccountBill",
            Operation::DescribeMetricList => "DescribeMetricList",
            Operation::DescribeRegions => "DescribeRegions",
            Operation::QueryAvailableInstances => "QueryAvailableInstances",
            Operation::DescribeInstances => "DescribeInstances",
            Operation::DescribeInstanceBill => "DescribeInstanceBill",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryAccountBillRequest {
    pub granularity: Granularity,
    pub billing_cycle: MonthKey,
    pub billing_date: Option<PeriodKey>,
    pub group_by_product: bool,
}

impl QueryAccountBillRequest {
    pub fn for_period(period: PeriodKey, group_by_product: bool) -> Self {
        Self {
            granularity: period.granularity(),
            billing_cycle: period.billing_cycle(),
            billing_date: matches!(period, PeriodKey::Day(_)).then_some(period),
            group_by_product,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountBill {
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub account_name: String,
    #[serde(default)]
    pub items: Vec<AccountBillItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountBillItem {
    pub product_code: String,
    pub product_name: String,
    #[serde(default)]
    pub billing_date: Option<String>,
    pub subscription_type: SubscriptionType,
    pub currency: String,
    pub pretax_amount: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricName {
    #[serde(rename = "cpu_utilization")]
    CpuUtilization,
    #[serde(rename = "memory_utilization")]
    MemoryUtilization,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescribeMetricListRequest {
    pub metric: MetricName,
    pub period_seconds: u32,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    #[serde(default)]
    pub instance_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub instance_id: String,
    pub average: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub region_id: String,
    pub region_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDetail {
    pub provider: CloudProvider,
    pub instance_id: String,
    pub region_id: String,
    #[serde(default)]
    pub region_name: String,
    pub subscription_type: SubscriptionType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceBill {
    pub instance_id: String,
    pub product_code: String,
    pub subscription_type: SubscriptionType,
    pub pretax_amount: Decimal,
    pub currency: String,
}

/// The billing, metrics and inventory capability of one cloud account.
#[async_trait]
pub trait Provider: Send + Sync {
    fn provider_type(&self) -> CloudProvider;

    async fn query_account_bill(
        &self,
        request: &QueryAccountBillRequest,
    ) -> Result<AccountBill, AppError>;

    async fn describe_metric_list(
        &self,
        request: &DescribeMetricListRequest,
    ) -> Result<Vec<MetricSample>, AppError>;

    async fn describe_regions(&self) -> Result<Vec<Region>, AppError> {
        Err(self.unsupported(Operation::DescribeRegions))
    }

    async fn query_available_instances(
        &self,
        _region_id: &str,
    ) -> Result<Vec<InstanceDetail>, AppError> {
        Err(self.unsupported(Operation::QueryAvailableInstances))
    }

    async fn describe_instances(
        &self,
        _instance_ids: &[String],
    ) -> Result<Vec<InstanceDetail>, AppError> {
        Err(self.unsupported(Operation::DescribeInstances))
    }

    /// Per-instance bill lines for one billing cycle. The report pipelines
    /// never call this; it is kept for callers reconciling instance costs.
    async fn describe_instance_bill(
        &self,
        _billing_cycle: MonthKey,
        _instance_id: Option<&str>,
    ) -> Result<Vec<InstanceBill>, AppError> {
        Err(self.unsupported(Operation::DescribeInstanceBill))
    }

    fn unsupported(&self, operation: Operation) -> AppError {
        AppError::Unsupported {
            provider: self.provider_type().to_string(),
            operation: operation.as_str(),
        }
    }
}

/// Builds the provider for a configured account: fixture replay when the
/// account points at a dataset file, the HTTP billing gateway otherwise.
pub fn build_provider(
    account: &CloudAccount,
    secret_key: Option<String>,
) -> Result<Arc<dyn Provider>, AppError> {
    if let Some(path) = &account.fixture {
        return Ok(Arc::new(fixture::FixtureProvider::load(account.provider, path)?));
    }

    let Some(endpoint) = &account.endpoint else {
        return Err(AppError::Config(format!(
            "Account '{}' needs either an endpoint or a fixture.",
            account.name
        )));
    };
    let secret_key = secret_key.ok_or_else(|| {
        AppError::Config(format!("No secret key found for account '{}'.", account.name))
    })?;
    Ok(Arc::new(gateway::GatewayProvider::new(
        account.provider,
        endpoint,
        gateway::Credentials {
            access_key: account.access_key.clone(),
            secret_key,
            region_id: account.region_id.clone(),
        },
    )?))
}
