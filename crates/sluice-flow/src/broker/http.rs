//! RabbitMQ channel over the HTTP management API.
//!
//! [`RabbitManagementChannel`] maps each [`BrokerChannel`] operation onto the
//! management plugin's REST endpoints. Publishing goes through
//! `POST /api/exchanges/{vhost}/{exchange}/publish`, whose `routed` flag gives
//! mandatory-delivery semantics.
//!
//! ## Error mapping
//!
//! | Response | Error |
//! |----------|-------|
//! | connect/timeout failure | [`BrokerError::ConnectionClosed`] |
//! | 5xx | [`BrokerError::ClosedByBroker`] |
//! | 404 | [`BrokerError::NotFound`] |
//! | other 4xx | [`BrokerError::Channel`] |
//! | `routed: false` | [`BrokerError::Unroutable`] |

use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{BrokerChannel, BrokerError, ExchangeKind, DEFAULT_EXCHANGE};

/// Name the management API uses for the default exchange.
const MANAGEMENT_DEFAULT_EXCHANGE: &str = "amq.default";

/// Per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection settings for the management API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RabbitManagementConfig {
    /// Base URL, e.g. `http://rabbitmq:15672`.
    pub api_url: String,
    /// Virtual host.
    pub vhost: String,
    /// User name.
    pub username: String,
    /// Password.
    #[serde(skip_serializing)]
    pub password: String,
}

impl RabbitManagementConfig {
    /// Creates a config for the default vhost.
    #[must_use]
    pub fn new(
        api_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            api_url: api_url.into(),
            vhost: "/".to_string(),
            username: username.into(),
            password: password.into(),
        }
    }

    /// Sets the virtual host.
    #[must_use]
    pub fn with_vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhost = vhost.into();
        self
    }
}

/// Broker channel backed by the RabbitMQ management API.
pub struct RabbitManagementChannel {
    config: RabbitManagementConfig,
    client: RwLock<Option<reqwest::Client>>,
}

impl std::fmt::Debug for RabbitManagementChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RabbitManagementChannel")
            .field("api_url", &self.config.api_url)
            .field("vhost", &self.config.vhost)
            .field("username", &self.config.username)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize)]
struct DeclareExchangeBody<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    durable: bool,
    auto_delete: bool,
}

#[derive(Debug, Serialize)]
struct DeclareQueueBody {
    durable: bool,
    auto_delete: bool,
}

#[derive(Debug, Serialize)]
struct BindBody<'a> {
    routing_key: &'a str,
}

#[derive(Debug, Serialize)]
struct PublishProperties {
    delivery_mode: u8,
    content_type: &'static str,
}

#[derive(Debug, Serialize)]
struct PublishBody<'a> {
    properties: PublishProperties,
    routing_key: &'a str,
    payload: &'a str,
    payload_encoding: &'static str,
}

#[derive(Debug, Deserialize)]
struct PublishResponse {
    routed: bool,
}

#[derive(Debug, Deserialize)]
struct ManagementError {
    #[serde(default)]
    reason: String,
}

fn poison_err<T>(_: PoisonError<T>) -> BrokerError {
    BrokerError::Transport("lock poisoned".into())
}

fn transport_error(err: &reqwest::Error) -> BrokerError {
    if err.is_connect() || err.is_timeout() || err.is_request() {
        BrokerError::ConnectionClosed(err.to_string())
    } else {
        BrokerError::Transport(err.to_string())
    }
}

impl RabbitManagementChannel {
    /// Creates a channel and opens its HTTP client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: RabbitManagementConfig) -> Result<Self, BrokerError> {
        let client = Self::build_client()?;
        Ok(Self {
            config,
            client: RwLock::new(Some(client)),
        })
    }

    fn build_client() -> Result<reqwest::Client, BrokerError> {
        reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BrokerError::Transport(format!("failed to create HTTP client: {e}")))
    }

    fn client(&self) -> Result<reqwest::Client, BrokerError> {
        self.client
            .read()
            .map_err(poison_err)?
            .clone()
            .ok_or_else(|| BrokerError::ConnectionClosed("channel is closed".into()))
    }

    /// Builds `{api_url}/api/{parts...}`, percent-encoding each part.
    fn url(&self, parts: &[&str]) -> Result<reqwest::Url, BrokerError> {
        let mut url = reqwest::Url::parse(&self.config.api_url)
            .map_err(|e| BrokerError::Transport(format!("invalid management API URL: {e}")))?;
        url.path_segments_mut()
            .map_err(|()| BrokerError::Transport("management API URL cannot be a base".into()))?
            .pop_if_empty()
            .push("api")
            .extend(parts);
        Ok(url)
    }

    fn exchange_segment(exchange: &str) -> &str {
        if exchange == DEFAULT_EXCHANGE {
            MANAGEMENT_DEFAULT_EXCHANGE
        } else {
            exchange
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder, resource: &str) -> Result<reqwest::Response, BrokerError> {
        let response = request
            .basic_auth(&self.config.username, Some(&self.config.password))
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let reason = serde_json::from_str::<ManagementError>(&body)
            .map(|e| e.reason)
            .ok()
            .filter(|r| !r.is_empty())
            .unwrap_or(body);

        Err(match status.as_u16() {
            404 => BrokerError::NotFound {
                resource: resource.to_string(),
            },
            code if status.is_server_error() => BrokerError::ClosedByBroker { code, reason },
            code => BrokerError::Channel { code, reason },
        })
    }
}

#[async_trait]
impl BrokerChannel for RabbitManagementChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        let url = self.url(&["exchanges", &self.config.vhost, name])?;
        let body = DeclareExchangeBody {
            kind: kind.as_str(),
            durable: true,
            auto_delete: false,
        };
        self.send(self.client()?.put(url).json(&body), &format!("exchange '{name}'"))
            .await
            .map(|_| ())
    }

    async fn declare_queue(&self, name: &str) -> Result<(), BrokerError> {
        let url = self.url(&["queues", &self.config.vhost, name])?;
        let body = DeclareQueueBody {
            durable: true,
            auto_delete: false,
        };
        self.send(self.client()?.put(url).json(&body), &format!("queue '{name}'"))
            .await
            .map(|_| ())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let url = self.url(&["bindings", &self.config.vhost, "e", exchange, "q", queue])?;
        let body = BindBody { routing_key };
        self.send(
            self.client()?.post(url).json(&body),
            &format!("binding '{exchange}' -> '{queue}'"),
        )
        .await
        .map(|_| ())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), BrokerError> {
        let payload = std::str::from_utf8(body)
            .map_err(|e| BrokerError::Transport(format!("payload is not UTF-8: {e}")))?;
        let url = self.url(&[
            "exchanges",
            &self.config.vhost,
            Self::exchange_segment(exchange),
            "publish",
        ])?;
        let request = PublishBody {
            properties: PublishProperties {
                delivery_mode: 2,
                content_type: "application/json",
            },
            routing_key,
            payload,
            payload_encoding: "string",
        };
        let response = self
            .send(
                self.client()?.post(url).json(&request),
                &format!("exchange '{exchange}'"),
            )
            .await?;
        let outcome: PublishResponse = response
            .json()
            .await
            .map_err(|e| BrokerError::Transport(format!("invalid publish response: {e}")))?;
        if outcome.routed {
            Ok(())
        } else {
            Err(BrokerError::Unroutable {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            })
        }
    }

    async fn delete_queue(&self, name: &str) -> Result<(), BrokerError> {
        let url = self.url(&["queues", &self.config.vhost, name])?;
        self.send(self.client()?.delete(url), &format!("queue '{name}'"))
            .await
            .map(|_| ())
    }

    async fn reconnect(&self) -> Result<(), BrokerError> {
        let client = Self::build_client()?;
        *self.client.write().map_err(poison_err)? = Some(client);
        tracing::info!(api_url = %self.config.api_url, "broker channel reconnected");
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        *self.client.write().map_err(poison_err)? = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> RabbitManagementChannel {
        RabbitManagementChannel::new(RabbitManagementConfig::new(
            "http://rabbit:15672/",
            "guest",
            "guest",
        ))
        .unwrap()
    }

    #[test]
    fn vhost_is_percent_encoded() {
        let url = channel().url(&["queues", "/", "abc_errors"]).unwrap();
        assert_eq!(url.as_str(), "http://rabbit:15672/api/queues/%2F/abc_errors");
    }

    #[test]
    fn reserved_characters_stay_inside_their_segment() {
        let url = channel()
            .url(&["exchanges", "prod/eu", "a b#c?d", "publish"])
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://rabbit:15672/api/exchanges/prod%2Feu/a%20b%23c%3Fd/publish"
        );
    }

    #[test]
    fn default_exchange_uses_management_name() {
        assert_eq!(
            RabbitManagementChannel::exchange_segment(DEFAULT_EXCHANGE),
            "amq.default"
        );
        assert_eq!(
            RabbitManagementChannel::exchange_segment("transformation_requests"),
            "transformation_requests"
        );
    }

    #[test]
    fn publish_body_shape() {
        let body = PublishBody {
            properties: PublishProperties {
                delivery_mode: 2,
                content_type: "application/json",
            },
            routing_key: "rid",
            payload: "{}",
            payload_encoding: "string",
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["routing_key"], "rid");
        assert_eq!(value["properties"]["delivery_mode"], 2);
        assert_eq!(value["payload_encoding"], "string");
    }

    #[tokio::test]
    async fn closed_channel_rejects_operations() {
        let channel = channel();
        channel.close().await.unwrap();
        let err = channel.declare_queue("q").await.unwrap_err();
        assert!(matches!(err, BrokerError::ConnectionClosed(_)));
    }

    #[test]
    fn debug_hides_password() {
        let rendered = format!("{:?}", channel());
        assert!(!rendered.contains("password"));
    }
}
