//! Client for the external billing console: orders, coupons and refunds.

use crate::resource::{BuyResource, UnitQuantity};
pub use crate::tenant::order_state::BuyMode;
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::*;

#[cfg(test)]
use mockall::automock;

const SDK_PREFIX: &str = "/api/thirdparty-cd/k8s-offline/sdk";
const ORDER_INFO_PATH: &str = "/api/thirdparty-cd/k8s-offline/order";

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("request to {0} failed: {1}")]
    Request(String, #[source] reqwest::Error),
    #[error("{0} answered {1}: {2}")]
    Status(String, StatusCode, String),
    #[error("unexpected response from {0}: {1}")]
    Decode(String, #[source] serde_json::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CouponStatus {
    Lock,
    Used,
    Unlock,
}

impl CouponStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CouponStatus::Lock => "lock",
            CouponStatus::Used => "used",
            CouponStatus::Unlock => "unlock",
        }
    }
}

fn lenient_i64<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    match Value::deserialize(d)? {
        Value::Null => Ok(0),
        Value::Number(n) => Ok(n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)).unwrap_or(0)),
        Value::String(s) if s.trim().is_empty() => Ok(0),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map(|f| f as i64)
            .map_err(|_| de::Error::custom(format!("invalid integer {:?}", s))),
        other => Err(de::Error::custom(format!("invalid integer {}", other))),
    }
}

fn lenient_string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Null => String::new(),
        Value::String(s) => s,
        other => other.to_string(),
    })
}

/// An order as the billing console reports it. Both the panel order
/// endpoint and the order-info endpoint answer with this shape, the latter
/// with `ip_`-prefixed keys.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BillingOrder {
    #[serde(rename = "orderId", default, deserialize_with = "lenient_i64")]
    pub order_id: i64,
    #[serde(rename = "orderSn", alias = "ip_order_sn", default, deserialize_with = "lenient_string")]
    pub order_sn: String,
    #[serde(rename = "orderStatus", alias = "ip_order_status", default, deserialize_with = "lenient_string")]
    pub order_status: String,
    #[serde(rename = "returnAt", default, deserialize_with = "lenient_string")]
    pub return_at: String,
    #[serde(rename = "buymode", alias = "buyMode", default, deserialize_with = "lenient_string")]
    pub buy_mode: String,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub cpu: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub memory: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub storage: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub bandwidth: i64,
    #[serde(default, deserialize_with = "lenient_string")]
    pub hour: String,
}

impl BillingOrder {
    pub fn is_paid(&self) -> bool {
        self.order_status == "paid"
    }

    pub fn buy_mode(&self) -> Option<BuyMode> {
        BuyMode::parse(&self.buy_mode)
    }

    /// Paid duration in whole hours; fractional hours are truncated.
    pub fn hours(&self) -> i64 {
        self.hour.trim().parse::<f64>().map(|h| h as i64).unwrap_or(0)
    }

    pub fn buy_resource(&self) -> BuyResource {
        BuyResource::new(self.cpu, self.memory, self.storage, self.bandwidth)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct PayResult {
    #[serde(rename = "needPay", default)]
    pub need_pay: bool,
    #[serde(default)]
    pub ticket: String,
    #[serde(rename = "ipOrderSn", default)]
    pub order_sn: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct LastPaidOrder {
    #[serde(rename = "canBuy", default)]
    pub can_buy: bool,
    #[serde(rename = "needCheckFinish", default)]
    pub need_check_finish: bool,
    #[serde(rename = "needCheckAfter", default)]
    pub need_check_after: bool,
    #[serde(rename = "k3kOrder", default)]
    pub order: Option<BillingOrder>,
    #[serde(default)]
    pub error: String,
    #[serde(rename = "goBtn", default)]
    pub go_button: String,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct LastReturnOrder {
    #[serde(rename = "hasOrder", default)]
    pub has_order: bool,
    #[serde(rename = "k3kOrder", default)]
    pub order: Option<BillingOrder>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct Coupon {
    #[serde(default)]
    pub code: String,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub discount: i64,
    #[serde(default)]
    pub groupname: String,
    #[serde(rename = "expiredAt", default)]
    pub expired_at: String,
    #[serde(rename = "canuse", default)]
    pub can_use: bool,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub cpu: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub memory: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub storage: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub bandwidth: i64,
    #[serde(default)]
    pub status: String,
    #[serde(rename = "timeunit", default)]
    pub time_unit: String,
    #[serde(rename = "timequantity", default, deserialize_with = "lenient_i64")]
    pub time_quantity: i64,
}

impl Coupon {
    pub fn buy_resource(&self) -> BuyResource {
        BuyResource::new(self.cpu, self.memory, self.storage, self.bandwidth)
    }

    pub fn unit_quantity(&self) -> UnitQuantity {
        UnitQuantity::new(self.time_quantity, &self.time_unit)
    }

    /// Discount percentage, never above full price.
    pub fn clamped_discount(&self) -> i64 {
        self.discount.min(100)
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
struct PreparedProduct {
    #[serde(rename = "productId", default, deserialize_with = "lenient_i64")]
    product_id: i64,
}

/// The billing console as the order lifecycle sees it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BillingApi: Send + Sync {
    async fn prepare_product(&self) -> Result<i64, BillingError>;
    async fn create_order(
        &self,
        tenant: &str,
        product_id: i64,
        params: Vec<(String, String)>,
    ) -> Result<PayResult, BillingError>;
    async fn order_info(&self, order_sn: &str) -> Result<BillingOrder, BillingError>;
    async fn find_order(&self, tenant: &str, order_sn: &str) -> Result<BillingOrder, BillingError>;
    async fn coupon(&self, code: &str) -> Result<Coupon, BillingError>;
    async fn update_coupon(&self, code: &str, status: CouponStatus, order_sn: &str) -> Result<(), BillingError>;
    async fn last_paid_order(&self, tenant: &str) -> Result<LastPaidOrder, BillingError>;
    async fn last_return_order(&self, tenant: &str) -> Result<LastReturnOrder, BillingError>;
    async fn return_order_finish(&self, tenant: &str, order_sn: &str) -> Result<(), BillingError>;
}

/// Form-encoded HTTP client for the billing console.
pub struct HttpBilling {
    http: reqwest::Client,
    base_url: String,
    token: String,
    cluster_id: String,
    app_id: String,
}

impl HttpBilling {
    pub fn new(base_url: &str, token: &str, cluster_id: &str, app_id: &str) -> Self {
        HttpBilling {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            cluster_id: cluster_id.to_string(),
            app_id: app_id.to_string(),
        }
    }

    async fn send(&self, method: Method, path: &str, form: &[(String, String)]) -> Result<String, BillingError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, method = %method, "billing request");
        let mut req = self
            .http
            .request(method.clone(), &url)
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/json");
        if !form.is_empty() {
            req = req.form(form);
        }
        let resp = req.send().await.map_err(|e| BillingError::Request(url.clone(), e))?;
        let status = resp.status();
        let body = resp.text().await.map_err(|e| BillingError::Request(url.clone(), e))?;
        if status.as_u16() > 299 {
            warn!(url = %url, status = %status, "billing request rejected");
            return Err(BillingError::Status(url, status, body));
        }
        Ok(body)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        form: &[(String, String)],
    ) -> Result<T, BillingError> {
        let body = self.send(method, path, form).await?;
        serde_json::from_str(&body).map_err(|e| BillingError::Decode(path.to_string(), e))
    }

    fn tenant_form(&self, tenant: &str) -> Vec<(String, String)> {
        vec![
            ("clusterId".to_string(), self.cluster_id.clone()),
            ("k3kName".to_string(), tenant.to_string()),
        ]
    }
}

#[async_trait]
impl BillingApi for HttpBilling {
    async fn prepare_product(&self) -> Result<i64, BillingError> {
        let product: PreparedProduct = self
            .send_json(Method::POST, &format!("{}/prepare2", SDK_PREFIX), &[])
            .await?;
        Ok(product.product_id)
    }

    async fn create_order(
        &self,
        tenant: &str,
        product_id: i64,
        params: Vec<(String, String)>,
    ) -> Result<PayResult, BillingError> {
        let mut form = vec![
            ("productId".to_string(), product_id.to_string()),
            ("clusterId".to_string(), self.cluster_id.clone()),
            ("k3kName".to_string(), tenant.to_string()),
            ("appid".to_string(), self.app_id.clone()),
        ];
        form.extend(params);
        self.send_json(Method::POST, &format!("{}/panel/create-order", SDK_PREFIX), &form)
            .await
    }

    async fn order_info(&self, order_sn: &str) -> Result<BillingOrder, BillingError> {
        let path = format!("{}?orderSn={}", ORDER_INFO_PATH, order_sn);
        self.send_json(Method::GET, &path, &[]).await
    }

    async fn find_order(&self, tenant: &str, order_sn: &str) -> Result<BillingOrder, BillingError> {
        let form = vec![
            ("k3kName".to_string(), tenant.to_string()),
            ("orderSn".to_string(), order_sn.to_string()),
        ];
        self.send_json(Method::POST, &format!("{}/panel/order", SDK_PREFIX), &form)
            .await
    }

    async fn coupon(&self, code: &str) -> Result<Coupon, BillingError> {
        self.send_json(Method::POST, &format!("{}/coupon/{}/info", SDK_PREFIX, code), &[])
            .await
    }

    async fn update_coupon(&self, code: &str, status: CouponStatus, order_sn: &str) -> Result<(), BillingError> {
        let form = vec![
            ("status".to_string(), status.as_str().to_string()),
            ("sn".to_string(), order_sn.to_string()),
        ];
        self.send(Method::PUT, &format!("{}/coupon/{}", SDK_PREFIX, code), &form)
            .await
            .map(|_| ())
    }

    async fn last_paid_order(&self, tenant: &str) -> Result<LastPaidOrder, BillingError> {
        self.send_json(
            Method::POST,
            &format!("{}/panel/lastpaidorder", SDK_PREFIX),
            &self.tenant_form(tenant),
        )
        .await
    }

    async fn last_return_order(&self, tenant: &str) -> Result<LastReturnOrder, BillingError> {
        self.send_json(
            Method::POST,
            &format!("{}/panel/lastreturnorder", SDK_PREFIX),
            &self.tenant_form(tenant),
        )
        .await
    }

    async fn return_order_finish(&self, tenant: &str, order_sn: &str) -> Result<(), BillingError> {
        let form = vec![
            ("k3kName".to_string(), tenant.to_string()),
            ("orderSn".to_string(), order_sn.to_string()),
        ];
        self.send(Method::PUT, &format!("{}/panel/lastreturnorder", SDK_PREFIX), &form)
            .await
            .map(|_| ())
    }
}
