//! Per-route request quotas.
//!
//! Unauthenticated routes are keyed by client IP, authenticated routes by
//! user id. Every limiter is a keyed token bucket refilled over an hour.

use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::request::Parts,
};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::ApiError;
use crate::config::RateLimitConfig;

/// How often idle keys are evicted from the limiters.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// A rate-limited route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Register,
    Login,
    RequestChat,
    AcceptChat,
    SendMessage,
}

impl Route {
    fn as_str(self) -> &'static str {
        match self {
            Route::Register => "register",
            Route::Login => "login",
            Route::RequestChat => "request_chat",
            Route::AcceptChat => "accept_chat",
            Route::SendMessage => "send_message",
        }
    }
}

pub struct RateLimits {
    enabled: bool,
    register: DefaultKeyedRateLimiter<String>,
    login: DefaultKeyedRateLimiter<String>,
    request_chat: DefaultKeyedRateLimiter<String>,
    accept_chat: DefaultKeyedRateLimiter<String>,
    send_message: DefaultKeyedRateLimiter<String>,
}

impl RateLimits {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            enabled: config.enabled,
            register: hourly(config.register_per_hour),
            login: hourly(config.login_per_hour),
            request_chat: hourly(config.request_chat_per_hour),
            accept_chat: hourly(config.accept_chat_per_hour),
            send_message: hourly(config.send_message_per_hour),
        }
    }

    /// Take one request from `key`'s quota on `route`.
    pub fn check(&self, route: Route, key: impl Into<String>) -> Result<(), ApiError> {
        if !self.enabled {
            return Ok(());
        }
        let key = key.into();
        match self.limiter(route).check_key(&key) {
            Ok(()) => Ok(()),
            Err(_) => {
                warn!(route = route.as_str(), key = %key, "Rate limit exceeded");
                Err(ApiError::TooManyRequests)
            }
        }
    }

    /// Drop state for keys whose buckets have fully refilled.
    pub fn retain_recent(&self) {
        for route in [
            Route::Register,
            Route::Login,
            Route::RequestChat,
            Route::AcceptChat,
            Route::SendMessage,
        ] {
            let limiter = self.limiter(route);
            limiter.retain_recent();
            limiter.shrink_to_fit();
        }
    }

    /// Periodically evict idle keys until the task is aborted.
    pub fn spawn_cleanup(self: &Arc<Self>) -> JoinHandle<()> {
        let limits = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                interval.tick().await;
                limits.retain_recent();
                debug!("Rate limiter state pruned");
            }
        })
    }

    fn limiter(&self, route: Route) -> &DefaultKeyedRateLimiter<String> {
        match route {
            Route::Register => &self.register,
            Route::Login => &self.login,
            Route::RequestChat => &self.request_chat,
            Route::AcceptChat => &self.accept_chat,
            Route::SendMessage => &self.send_message,
        }
    }
}

fn hourly(per_hour: u32) -> DefaultKeyedRateLimiter<String> {
    RateLimiter::keyed(Quota::per_hour(
        NonZeroU32::new(per_hour).unwrap_or(NonZeroU32::MIN),
    ))
}

/// Best-effort client address: first `X-Forwarded-For` hop, then the peer
/// address, then `"unknown"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIp(pub String);

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for ClientIp {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty());
        if let Some(ip) = forwarded {
            return Ok(ClientIp(ip.to_string()));
        }

        let ip = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Ok(ClientIp(ip))
    }
}
