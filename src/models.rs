use crate::calendar::PeriodKey;
use crate::error::AppError;
use crate::providers::{AccountBill, CloudProvider};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SubscriptionType {
    PrePaid,
    PostPaid,
    #[serde(other)]
    Undefined,
}

impl SubscriptionType {
    pub fn as_label(self) -> &'static str {
        match self {
            SubscriptionType::PrePaid => "Subscription",
            SubscriptionType::PostPaid => "Pay-as-you-go",
            SubscriptionType::Undefined => "Undefined",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingItem {
    pub subscription_type: SubscriptionType,
    pub amount: Decimal,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductBilling {
    pub product_name: String,
    pub total_amount: Decimal,
    pub items: Vec<BillingItem>,
}

impl ProductBilling {
    fn add_item(&mut self, item: BillingItem) {
        self.total_amount += item.amount;
        match self
            .items
            .iter_mut()
            .find(|existing| existing.subscription_type == item.subscription_type)
        {
            Some(existing) => existing.amount += item.amount,
            None => self.items.push(item),
        }
    }
}

/// One rollup record: all activity for a period key across the accounts
/// listed in `accounts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodBilling {
    pub period: PeriodKey,
    pub products: BTreeMap<String, ProductBilling>,
    pub provider_totals: BTreeMap<CloudProvider, Decimal>,
    pub accounts: BTreeSet<String>,
    pub total_amount: Decimal,
}

impl PeriodBilling {
    pub fn empty(period: PeriodKey, account: &str) -> Self {
        Self {
            period,
            products: BTreeMap::new(),
            provider_totals: BTreeMap::new(),
            accounts: BTreeSet::from([account.to_string()]),
            total_amount: Decimal::ZERO,
        }
    }

    /// Normalizes one provider response into a record for `account`.
    pub fn from_account_bill(
        period: PeriodKey,
        provider: CloudProvider,
        account: &str,
        bill: AccountBill,
    ) -> Self {
        let mut billing = Self::empty(period, account);
        for row in bill.items {
            let item = BillingItem {
                subscription_type: row.subscription_type,
                amount: row.pretax_amount,
                currency: row.currency,
            };
            billing.total_amount += item.amount;
            *billing.provider_totals.entry(provider).or_default() += item.amount;
            billing
                .products
                .entry(row.product_code)
                .or_insert_with(|| ProductBilling {
                    product_name: row.product_name,
                    total_amount: Decimal::ZERO,
                    items: Vec::new(),
                })
                .add_item(item);
        }
        billing
    }

    pub fn currency(&self) -> Option<&str> {
        self.products
            .values()
            .find_map(|p| p.items.first())
            .map(|item| item.currency.as_str())
    }

    fn check_mergeable(&self, incoming: &PeriodBilling) -> Result<(), AppError> {
        if self.period != incoming.period {
            return Err(AppError::mismatch(
                self.period,
                format!("cannot merge record for {}", incoming.period),
            ));
        }
        if let Some(account) = self.accounts.intersection(&incoming.accounts).next() {
            return Err(AppError::mismatch(
                self.period,
                format!("account '{account}' is already rolled up"),
            ));
        }
        for (code, product) in &incoming.products {
            if let Some(existing) = self.products.get(code) {
                if existing.product_name != product.product_name {
                    return Err(AppError::mismatch(
                        self.period,
                        format!(
                            "product '{code}' is '{}' on one side and '{}' on the other",
                            existing.product_name, product.product_name
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Adds `incoming` into `self`. Nothing is modified when the records
    /// cannot be merged.
    pub fn merge_from(&mut self, incoming: PeriodBilling) -> Result<(), AppError> {
        self.check_mergeable(&incoming)?;

        self.total_amount += incoming.total_amount;
        self.accounts.extend(incoming.accounts);
        for (provider, amount) in incoming.provider_totals {
            *self.provider_totals.entry(provider).or_default() += amount;
        }
        for (code, product) in incoming.products {
            match self.products.get_mut(&code) {
                Some(existing) => {
                    for item in product.items {
                        existing.add_item(item);
                    }
                }
                None => {
                    self.products.insert(code, product);
                }
            }
        }
        Ok(())
    }
}

pub fn merge_period(
    existing: &PeriodBilling,
    incoming: &PeriodBilling,
) -> Result<PeriodBilling, AppError> {
    let mut merged = existing.clone();
    merged.merge_from(incoming.clone())?;
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::parse_day;
    use crate::providers::AccountBillItem;

    fn dec(raw: &str) -> Decimal {
        raw.parse().expect("decimal")
    }

    fn period() -> PeriodKey {
        PeriodKey::Day(parse_day("2022-03-10").expect("day"))
    }

    fn row(code: &str, name: &str, sub: SubscriptionType, amount: &str) -> AccountBillItem {
        AccountBillItem {
            product_code: code.into(),
            product_name: name.into(),
            billing_date: None,
            subscription_type: sub,
            currency: "CNY".into(),
            pretax_amount: dec(amount),
        }
    }

    fn record(account: &str, rows: Vec<AccountBillItem>) -> PeriodBilling {
        PeriodBilling::from_account_bill(
            period(),
            CloudProvider::Alibaba,
            account,
            AccountBill {
                items: rows,
                ..AccountBill::default()
            },
        )
    }

    fn assert_totals_consistent(b: &PeriodBilling) {
        let products: Decimal = b.products.values().map(|p| p.total_amount).sum();
        let providers: Decimal = b.provider_totals.values().copied().sum();
        assert_eq!(b.total_amount, products);
        assert_eq!(b.total_amount, providers);
        for p in b.products.values() {
            let items: Decimal = p.items.iter().map(|i| i.amount).sum();
            assert_eq!(p.total_amount, items);
        }
    }

    #[test]
    fn from_account_bill_groups_by_product_and_subscription() {
        let b = record(
            "acct-a",
            vec![
                row("ecs", "ECS", SubscriptionType::PostPaid, "1.10"),
                row("ecs", "ECS", SubscriptionType::PostPaid, "2.20"),
                row("ecs", "ECS", SubscriptionType::PrePaid, "3.00"),
                row("oss", "OSS", SubscriptionType::PostPaid, "0.70"),
            ],
        );
        assert_eq!(b.total_amount, dec("7.00"));
        assert_eq!(b.products["ecs"].items.len(), 2);
        assert_eq!(b.products["ecs"].items[0].amount, dec("3.30"));
        assert_eq!(b.currency(), Some("CNY"));
        assert_totals_consistent(&b);
    }

    #[test]
    fn merge_adds_matching_items_in_place() {
        let a = record("acct-a", vec![row("ecs", "ECS", SubscriptionType::PostPaid, "10")]);
        let b = record(
            "acct-b",
            vec![
                row("ecs", "ECS", SubscriptionType::PostPaid, "5"),
                row("ecs", "ECS", SubscriptionType::PrePaid, "1"),
            ],
        );
        let merged = merge_period(&a, &b).expect("merge");
        assert_eq!(merged.total_amount, dec("16"));
        let ecs = &merged.products["ecs"];
        assert_eq!(ecs.items.len(), 2);
        assert_eq!(ecs.items[0].amount, dec("15"));
        assert_eq!(ecs.items[1].subscription_type, SubscriptionType::PrePaid);
        assert_eq!(merged.accounts.len(), 2);
        assert_totals_consistent(&merged);
    }

    #[test]
    fn merge_is_commutative_for_disjoint_subscription_types() {
        let a = record(
            "acct-a",
            vec![
                row("ecs", "ECS", SubscriptionType::PostPaid, "4.25"),
                row("rds", "RDS", SubscriptionType::PostPaid, "1.00"),
            ],
        );
        let b = record(
            "acct-b",
            vec![
                row("ecs", "ECS", SubscriptionType::PrePaid, "2.75"),
                row("oss", "OSS", SubscriptionType::PrePaid, "0.50"),
            ],
        );
        let ab = merge_period(&a, &b).expect("a+b");
        let ba = merge_period(&b, &a).expect("b+a");
        assert_eq!(ab.total_amount, ba.total_amount);
        assert_eq!(ab.products.len(), ba.products.len());
        for (code, product) in &ab.products {
            let other = &ba.products[code];
            assert_eq!(product.total_amount, other.total_amount);
            let mut left: Vec<_> = product.items.iter().map(|i| (i.subscription_type, i.amount)).collect();
            let mut right: Vec<_> = other.items.iter().map(|i| (i.subscription_type, i.amount)).collect();
            left.sort();
            right.sort();
            assert_eq!(left, right);
        }
        assert_totals_consistent(&ab);
    }

    #[test]
    fn merge_rejects_mismatched_product_names() {
        let mut a = record("acct-a", vec![row("ecs", "ECS", SubscriptionType::PostPaid, "1")]);
        let b = record("acct-b", vec![row("ecs", "Elastic", SubscriptionType::PostPaid, "1")]);
        let before = a.clone();
        let err = a.merge_from(b).expect_err("mismatch");
        assert!(err.is_bad_data());
        assert!(err.to_string().contains("mismatched period 2022-03-10"));
        assert_eq!(a, before);
    }

    #[test]
    fn merge_rejects_same_account_twice() {
        let a = record("acct-a", vec![row("ecs", "ECS", SubscriptionType::PostPaid, "1")]);
        let err = merge_period(&a, &a).expect_err("double count");
        assert!(matches!(err, AppError::MergeMismatch { .. }));
    }

    #[test]
    fn empty_bill_has_no_provider_totals() {
        let b = record("acct-a", vec![]);
        assert!(b.provider_totals.is_empty());
        assert!(b.accounts.contains("acct-a"));
        assert_totals_consistent(&b);
    }

    #[test]
    fn merge_rejects_different_periods() {
        let a = record("acct-a", vec![]);
        let mut b = record("acct-b", vec![]);
        b.period = PeriodKey::Day(parse_day("2022-03-11").expect("day"));
        assert!(merge_period(&a, &b).is_err());
    }
}
