//! Outbound REST client.
//!
//! Tenant-token authenticated calls against the platform API. Each call is
//! independent and non-transactional; the platform's result (success plus
//! message ID) is returned to the caller unchanged.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use {
    async_trait::async_trait,
    secrecy::{ExposeSecret, Secret},
    serde::Deserialize,
    serde_json::{Value, json},
    tracing::warn,
};

use perch_channels::{ChannelOutbound, ReplyPayload, SendReceipt};

use crate::{
    config::ResolvedAccount,
    error::{Error, Result},
    runtime::FeishuRuntime,
};

#[derive(Clone)]
struct CachedTenantToken {
    token: Secret<String>,
    expires_at: Instant,
}

impl CachedTenantToken {
    fn is_valid(&self) -> bool {
        let refresh_skew = Duration::from_secs(60);
        self.expires_at > Instant::now() + refresh_skew
    }
}

/// Where an outbound message goes, in the platform's addressing scheme.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct SendTarget {
    pub receive_id_type: &'static str,
    pub receive_id: String,
}

/// Parse a composed target address. Prefixes win; bare IDs are classified by
/// their platform prefix, defaulting to a user ID.
pub(crate) fn parse_target(raw: &str) -> SendTarget {
    let raw = raw.trim();
    if let Some(id) = raw.strip_prefix("user:") {
        return SendTarget {
            receive_id_type: "user_id",
            receive_id: id.to_string(),
        };
    }
    if let Some(id) = raw.strip_prefix("open:") {
        return SendTarget {
            receive_id_type: "open_id",
            receive_id: id.to_string(),
        };
    }
    if let Some(id) = raw.strip_prefix("chat:") {
        return SendTarget {
            receive_id_type: "chat_id",
            receive_id: id.to_string(),
        };
    }
    let receive_id_type = if raw.starts_with("oc_") {
        "chat_id"
    } else if raw.starts_with("ou_") {
        "open_id"
    } else {
        "user_id"
    };
    SendTarget {
        receive_id_type,
        receive_id: raw.to_string(),
    }
}

#[derive(Deserialize)]
struct ApiEnvelope {
    code: i64,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Value,
}

/// Unwrap a platform API response, mapping non-zero codes to downstream
/// errors.
async fn api_result(resp: reqwest::Response, context: &str) -> Result<Value> {
    if !resp.status().is_success() {
        return Err(Error::downstream(format!(
            "{context} failed ({})",
            resp.status()
        )));
    }
    let body: ApiEnvelope = resp.json().await?;
    if body.code != 0 {
        return Err(Error::downstream(format!(
            "{context} rejected (code {}): {}",
            body.code, body.msg
        )));
    }
    Ok(body.data)
}

fn receipt_from(data: &Value) -> SendReceipt {
    SendReceipt {
        message_id: data
            .get("message_id")
            .and_then(Value::as_str)
            .map(String::from),
    }
}

/// REST client bound to one account's credentials.
pub struct FeishuClient {
    app_id: String,
    app_secret: Secret<String>,
    base_url: String,
    token: tokio::sync::Mutex<Option<CachedTenantToken>>,
}

impl FeishuClient {
    /// Build a client for an account. Credentials are required: an account
    /// without app ID and secret is not usable for outbound calls.
    pub fn for_account(account: &ResolvedAccount) -> Result<Self> {
        if !account.is_configured() {
            return Err(Error::configuration(format!(
                "account {} has no app_id/app_secret",
                account.account_id
            )));
        }
        Ok(Self {
            app_id: account.app_id.clone().unwrap_or_default(),
            app_secret: account
                .app_secret
                .clone()
                .unwrap_or_else(|| Secret::new(String::new())),
            base_url: account.rest_base_url().to_string(),
            token: tokio::sync::Mutex::new(None),
        })
    }

    async fn tenant_token(&self, http: &reqwest::Client) -> Result<Secret<String>> {
        {
            let guard = self.token.lock().await;
            if let Some(cached) = guard.as_ref()
                && cached.is_valid()
            {
                return Ok(cached.token.clone());
            }
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            code: i64,
            #[serde(default)]
            msg: String,
            tenant_access_token: Option<String>,
            expire: Option<u64>,
        }

        let url = format!("{}/auth/v3/tenant_access_token/internal", self.base_url);
        let resp = http
            .post(&url)
            .json(&json!({
                "app_id": self.app_id,
                "app_secret": self.app_secret.expose_secret(),
            }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::downstream(format!(
                "tenant token request failed ({})",
                resp.status()
            )));
        }
        let body: TokenResponse = resp.json().await?;
        if body.code != 0 {
            return Err(Error::downstream(format!(
                "tenant token rejected (code {}): {}",
                body.code, body.msg
            )));
        }
        let token = body
            .tenant_access_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| Error::downstream("tenant token response missing token"))?;

        let ttl = body.expire.unwrap_or(3600).max(120);
        let cached = CachedTenantToken {
            token: Secret::new(token),
            expires_at: Instant::now() + Duration::from_secs(ttl),
        };
        let token = cached.token.clone();
        let mut guard = self.token.lock().await;
        *guard = Some(cached);
        Ok(token)
    }

    /// Create a message, threading it onto `reply_to_id` when given.
    async fn send_message(
        &self,
        http: &reqwest::Client,
        to: &str,
        msg_type: &str,
        content: String,
        reply_to_id: Option<&str>,
    ) -> Result<SendReceipt> {
        let token = self.tenant_token(http).await?;
        let resp = match reply_to_id {
            Some(parent) => {
                http.post(format!("{}/im/v1/messages/{parent}/reply", self.base_url))
                    .bearer_auth(token.expose_secret())
                    .json(&json!({ "msg_type": msg_type, "content": content }))
                    .send()
                    .await?
            },
            None => {
                let target = parse_target(to);
                http.post(format!("{}/im/v1/messages", self.base_url))
                    .query(&[("receive_id_type", target.receive_id_type)])
                    .bearer_auth(token.expose_secret())
                    .json(&json!({
                        "receive_id": target.receive_id,
                        "msg_type": msg_type,
                        "content": content,
                    }))
                    .send()
                    .await?
            },
        };
        let data = api_result(resp, "send message").await?;
        Ok(receipt_from(&data))
    }

    pub async fn send_text(
        &self,
        http: &reqwest::Client,
        to: &str,
        text: &str,
        reply_to_id: Option<&str>,
    ) -> Result<SendReceipt> {
        let content = json!({ "text": text }).to_string();
        self.send_message(http, to, "text", content, reply_to_id)
            .await
    }

    /// Send media: fetch the bytes, push them to the image store, send an
    /// image message. A non-empty caption goes out as a separate text
    /// message; the two calls are independent.
    pub async fn send_media(
        &self,
        http: &reqwest::Client,
        to: &str,
        caption: &str,
        media_url: &str,
        reply_to_id: Option<&str>,
    ) -> Result<SendReceipt> {
        let bytes = http
            .get(media_url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        let token = self.tenant_token(http).await?;
        let part = reqwest::multipart::Part::bytes(bytes.to_vec()).file_name("upload");
        let form = reqwest::multipart::Form::new()
            .text("image_type", "message")
            .part("image", part);
        let resp = http
            .post(format!("{}/im/v1/images", self.base_url))
            .bearer_auth(token.expose_secret())
            .multipart(form)
            .send()
            .await?;
        let data = api_result(resp, "image upload").await?;
        let image_key = data
            .get("image_key")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::downstream("image upload response missing image_key"))?;

        let content = json!({ "image_key": image_key }).to_string();
        let receipt = self
            .send_message(http, to, "image", content, reply_to_id)
            .await?;

        if !caption.is_empty()
            && let Err(err) = self.send_text(http, to, caption, None).await
        {
            warn!(error = %err, "media caption delivery failed");
        }
        Ok(receipt)
    }

    /// Add or remove a reaction on a message. Removal looks the reaction up
    /// first; the platform deletes by reaction ID, not emoji.
    pub async fn react(
        &self,
        http: &reqwest::Client,
        message_id: &str,
        emoji: &str,
        remove: bool,
    ) -> Result<Value> {
        let token = self.tenant_token(http).await?;
        if !remove {
            let resp = http
                .post(format!(
                    "{}/im/v1/messages/{message_id}/reactions",
                    self.base_url
                ))
                .bearer_auth(token.expose_secret())
                .json(&json!({ "reaction_type": { "emoji_type": emoji } }))
                .send()
                .await?;
            return api_result(resp, "add reaction").await;
        }

        let listing = http
            .get(format!(
                "{}/im/v1/messages/{message_id}/reactions",
                self.base_url
            ))
            .query(&[("reaction_type", emoji)])
            .bearer_auth(token.expose_secret())
            .send()
            .await?;
        let data = api_result(listing, "list reactions").await?;
        let reaction_id = data
            .get("items")
            .and_then(Value::as_array)
            .and_then(|items| {
                items.iter().find_map(|item| {
                    item.get("reaction_id").and_then(Value::as_str)
                })
            })
            .ok_or_else(|| Error::downstream("reaction not found"))?;

        let resp = http
            .delete(format!(
                "{}/im/v1/messages/{message_id}/reactions/{reaction_id}",
                self.base_url
            ))
            .bearer_auth(token.expose_secret())
            .send()
            .await?;
        api_result(resp, "remove reaction").await
    }

    /// Replace a message's text content.
    pub async fn edit_text(
        &self,
        http: &reqwest::Client,
        message_id: &str,
        text: &str,
    ) -> Result<SendReceipt> {
        let token = self.tenant_token(http).await?;
        let content = json!({ "text": text }).to_string();
        let resp = http
            .put(format!("{}/im/v1/messages/{message_id}", self.base_url))
            .bearer_auth(token.expose_secret())
            .json(&json!({ "msg_type": "text", "content": content }))
            .send()
            .await?;
        let data = api_result(resp, "edit message").await?;
        Ok(receipt_from(&data))
    }

    pub async fn delete_message(&self, http: &reqwest::Client, message_id: &str) -> Result<()> {
        let token = self.tenant_token(http).await?;
        let resp = http
            .delete(format!("{}/im/v1/messages/{message_id}", self.base_url))
            .bearer_auth(token.expose_secret())
            .send()
            .await?;
        api_result(resp, "delete message").await?;
        Ok(())
    }

    pub async fn pin_message(
        &self,
        http: &reqwest::Client,
        message_id: &str,
        remove: bool,
    ) -> Result<()> {
        let token = self.tenant_token(http).await?;
        let resp = if remove {
            http.delete(format!("{}/im/v1/pins/{message_id}", self.base_url))
                .bearer_auth(token.expose_secret())
                .send()
                .await?
        } else {
            http.post(format!("{}/im/v1/pins", self.base_url))
                .bearer_auth(token.expose_secret())
                .json(&json!({ "message_id": message_id }))
                .send()
                .await?
        };
        api_result(resp, "pin message").await?;
        Ok(())
    }

    /// Look a user up by user ID. The platform payload is returned unchanged.
    pub async fn member_info(&self, http: &reqwest::Client, user_id: &str) -> Result<Value> {
        let token = self.tenant_token(http).await?;
        let resp = http
            .get(format!("{}/contact/v3/users/{user_id}", self.base_url))
            .query(&[("user_id_type", "user_id")])
            .bearer_auth(token.expose_secret())
            .send()
            .await?;
        api_result(resp, "member lookup").await
    }
}

/// `ChannelOutbound` adapter resolving accounts per call.
pub struct FeishuOutbound {
    runtime: Arc<FeishuRuntime>,
}

impl FeishuOutbound {
    pub fn new(runtime: Arc<FeishuRuntime>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl ChannelOutbound for FeishuOutbound {
    async fn send_text(
        &self,
        account_id: &str,
        to: &str,
        text: &str,
    ) -> anyhow::Result<SendReceipt> {
        let account = self.runtime.resolve(Some(account_id));
        let client = FeishuClient::for_account(&account)?;
        let receipt = client.send_text(self.runtime.http(), to, text, None).await?;
        self.runtime.registry().note_outbound(&account.account_id);
        Ok(receipt)
    }

    async fn send_media(
        &self,
        account_id: &str,
        to: &str,
        payload: &ReplyPayload,
    ) -> anyhow::Result<SendReceipt> {
        let account = self.runtime.resolve(Some(account_id));
        let client = FeishuClient::for_account(&account)?;
        let caption = payload.text.as_deref().unwrap_or_default();
        let receipt = match payload.media_url.as_deref() {
            Some(media_url) => {
                client
                    .send_media(self.runtime.http(), to, caption, media_url, None)
                    .await?
            },
            None => {
                client
                    .send_text(self.runtime.http(), to, caption, None)
                    .await?
            },
        };
        self.runtime.registry().note_outbound(&account.account_id);
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::FeishuConfig;

    fn resolved(config: serde_json::Value) -> ResolvedAccount {
        let cfg: FeishuConfig = serde_json::from_value(config).unwrap();
        cfg.resolve(None)
    }

    #[test]
    fn parse_target_honors_prefixes() {
        assert_eq!(parse_target("user:u1"), SendTarget {
            receive_id_type: "user_id",
            receive_id: "u1".into(),
        });
        assert_eq!(parse_target("open:ou_x"), SendTarget {
            receive_id_type: "open_id",
            receive_id: "ou_x".into(),
        });
        assert_eq!(parse_target("chat:oc_y"), SendTarget {
            receive_id_type: "chat_id",
            receive_id: "oc_y".into(),
        });
    }

    #[test]
    fn parse_target_classifies_bare_ids() {
        assert_eq!(parse_target("oc_group").receive_id_type, "chat_id");
        assert_eq!(parse_target("ou_open").receive_id_type, "open_id");
        assert_eq!(parse_target("plain_user").receive_id_type, "user_id");
        assert_eq!(parse_target("  user:u1 ").receive_id, "u1");
    }

    #[test]
    fn client_requires_credentials() {
        let unconfigured = resolved(json!({ "app_id": "cli_only" }));
        assert!(matches!(
            FeishuClient::for_account(&unconfigured),
            Err(Error::Configuration { .. })
        ));

        let configured = resolved(json!({ "app_id": "cli", "app_secret": "sec" }));
        assert!(FeishuClient::for_account(&configured).is_ok());
    }

    #[test]
    fn cached_token_expiry_uses_refresh_skew() {
        let fresh = CachedTenantToken {
            token: Secret::new("tok".into()),
            expires_at: Instant::now() + Duration::from_secs(3600),
        };
        assert!(fresh.is_valid());

        // Within the refresh skew: treated as expired so it gets refreshed.
        let stale = CachedTenantToken {
            token: Secret::new("tok".into()),
            expires_at: Instant::now() + Duration::from_secs(30),
        };
        assert!(!stale.is_valid());
    }

    #[tokio::test]
    async fn send_text_threads_replies_and_caches_token() {
        let mut server = mockito::Server::new_async().await;
        let token = server
            .mock("POST", "/auth/v3/tenant_access_token/internal")
            .with_body(
                json!({ "code": 0, "tenant_access_token": "tat", "expire": 7200 }).to_string(),
            )
            .expect(1)
            .create_async()
            .await;
        let create = server
            .mock("POST", "/im/v1/messages")
            .match_query(mockito::Matcher::UrlEncoded(
                "receive_id_type".into(),
                "user_id".into(),
            ))
            .with_body(json!({ "code": 0, "data": { "message_id": "om_new" } }).to_string())
            .expect(1)
            .create_async()
            .await;
        let reply = server
            .mock("POST", "/im/v1/messages/om_parent/reply")
            .with_body(json!({ "code": 0, "data": { "message_id": "om_reply" } }).to_string())
            .expect(1)
            .create_async()
            .await;

        let account = resolved(json!({
            "app_id": "cli", "app_secret": "sec", "base_url": server.url()
        }));
        let client = FeishuClient::for_account(&account).unwrap();
        let http = reqwest::Client::new();

        let receipt = client.send_text(&http, "user:u1", "hi", None).await.unwrap();
        assert_eq!(receipt.message_id.as_deref(), Some("om_new"));

        let threaded = client
            .send_text(&http, "user:u1", "hi again", Some("om_parent"))
            .await
            .unwrap();
        assert_eq!(threaded.message_id.as_deref(), Some("om_reply"));

        // One token fetch serves both sends.
        token.assert_async().await;
        create.assert_async().await;
        reply.assert_async().await;
    }

    #[tokio::test]
    async fn non_zero_api_code_is_a_downstream_error() {
        let mut server = mockito::Server::new_async().await;
        let _token = server
            .mock("POST", "/auth/v3/tenant_access_token/internal")
            .with_body(json!({ "code": 0, "tenant_access_token": "tat" }).to_string())
            .create_async()
            .await;
        let _create = server
            .mock("POST", "/im/v1/messages")
            .match_query(mockito::Matcher::Any)
            .with_body(json!({ "code": 230002, "msg": "bot not in chat" }).to_string())
            .create_async()
            .await;

        let account = resolved(json!({
            "app_id": "cli", "app_secret": "sec", "base_url": server.url()
        }));
        let client = FeishuClient::for_account(&account).unwrap();
        let err = client
            .send_text(&reqwest::Client::new(), "chat:oc_1", "hi", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Downstream { .. }));
        assert!(err.to_string().contains("230002"));
    }
}
