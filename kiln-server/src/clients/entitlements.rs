//! Entitlement service client.
//!
//! [`HttpEntitlements`] talks to the user-plan service over REST.
//! [`StaticEntitlements`] is the standalone fallback: every capability is
//! allowed, nothing is free, and the concurrency limit comes from config.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use kiln_core::{EntitlementError, EntitlementService, PermissionGrant, ProviderId, TaskKind};

pub struct HttpEntitlements {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct PermissionBody {
    allowed: bool,
    reason: Option<String>,
    #[serde(default)]
    free: bool,
    #[serde(default)]
    free_remaining: u32,
}

#[derive(Debug, Deserialize)]
struct ConcurrencyBody {
    limit: u32,
}

#[derive(Debug, Deserialize)]
struct RetentionBody {
    days: Option<i64>,
}

impl HttpEntitlements {
    pub fn new(base_url: &str) -> Result<Self, EntitlementError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| EntitlementError(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }

    fn err(e: impl std::fmt::Display) -> EntitlementError {
        EntitlementError(e.to_string())
    }
}

#[async_trait]
impl EntitlementService for HttpEntitlements {
    async fn check_permission(
        &self,
        user_id: &str,
        kind: TaskKind,
        provider: ProviderId,
    ) -> Result<PermissionGrant, EntitlementError> {
        let body: PermissionBody = self
            .http
            .post(format!("{}/permissions/check", self.base_url))
            .json(&json!({
                "user_id": user_id,
                "kind": kind,
                "provider": provider,
            }))
            .send()
            .await
            .map_err(Self::err)?
            .error_for_status()
            .map_err(Self::err)?
            .json()
            .await
            .map_err(Self::err)?;
        Ok(PermissionGrant {
            allowed: body.allowed,
            reason: body.reason,
            free: body.free,
            free_remaining: body.free_remaining,
        })
    }

    async fn max_concurrency(&self, user_id: &str) -> Result<u32, EntitlementError> {
        let body: ConcurrencyBody = self
            .http
            .get(format!("{}/users/{user_id}/concurrency", self.base_url))
            .send()
            .await
            .map_err(Self::err)?
            .error_for_status()
            .map_err(Self::err)?
            .json()
            .await
            .map_err(Self::err)?;
        Ok(body.limit)
    }

    async fn record_usage(
        &self,
        user_id: &str,
        provider: ProviderId,
        free: bool,
    ) -> Result<(), EntitlementError> {
        self.http
            .post(format!("{}/usage", self.base_url))
            .json(&json!({
                "user_id": user_id,
                "provider": provider,
                "free": free,
            }))
            .send()
            .await
            .map_err(Self::err)?
            .error_for_status()
            .map_err(Self::err)?;
        Ok(())
    }

    async fn retention(
        &self,
        user_id: &str,
    ) -> Result<Option<chrono::Duration>, EntitlementError> {
        let body: RetentionBody = self
            .http
            .get(format!("{}/users/{user_id}/retention", self.base_url))
            .send()
            .await
            .map_err(Self::err)?
            .error_for_status()
            .map_err(Self::err)?
            .json()
            .await
            .map_err(Self::err)?;
        Ok(body.days.map(chrono::Duration::days))
    }
}

/// Permissive standalone policy.
pub struct StaticEntitlements {
    pub max_concurrency: u32,
}

#[async_trait]
impl EntitlementService for StaticEntitlements {
    async fn check_permission(
        &self,
        _user_id: &str,
        _kind: TaskKind,
        _provider: ProviderId,
    ) -> Result<PermissionGrant, EntitlementError> {
        Ok(PermissionGrant {
            allowed: true,
            reason: None,
            free: false,
            free_remaining: 0,
        })
    }

    async fn max_concurrency(&self, _user_id: &str) -> Result<u32, EntitlementError> {
        Ok(self.max_concurrency)
    }

    async fn record_usage(
        &self,
        _user_id: &str,
        _provider: ProviderId,
        _free: bool,
    ) -> Result<(), EntitlementError> {
        Ok(())
    }

    async fn retention(
        &self,
        _user_id: &str,
    ) -> Result<Option<chrono::Duration>, EntitlementError> {
        Ok(None)
    }
}
