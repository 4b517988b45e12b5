//! Login risk scoring.
//!
//! `assess` only reads history; the device record is updated separately by
//! `record_device_login` once a login actually succeeds.

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::models::{artifact::keys, Device, User};
use crate::services::{Clock, EphemeralStore, IdentityRepository, ServiceError};

pub const MAX_SCORE: i32 = 100;

const NEW_DEVICE: i32 = 20;
const TRUSTED_DEVICE: i32 = -10;
const USER_AGENT_CHANGED: i32 = 10;
const NEW_IP: i32 = 15;
const PER_FAILURE: i32 = 5;
const COUNTED_FAILURES: i64 = 5;
const FAILURE_CLIFF: i32 = 20;
const OFF_HOURS: i32 = 10;
const DORMANT_WEEK: i32 = 15;
const DORMANT_MONTH: i32 = 25;
const FIRST_LOGIN: i32 = 10;
const IP_REPUTATION_WEIGHT: i32 = 10;

#[derive(Debug, Clone, Default, PartialEq, Serialize, ToSchema)]
pub struct RiskFactors {
    pub new_device: bool,
    pub trusted_device: bool,
    pub user_agent_changed: bool,
    pub new_ip: bool,
    pub recent_failures: i64,
    pub off_hours: bool,
    /// 0..=80, higher is worse
    pub ip_reputation: u8,
    pub days_since_last_login: Option<i64>,
    pub first_login: bool,
}

impl RiskFactors {
    /// Weighted sum of the factors, clamped to 0..=100.
    pub fn score(&self) -> u8 {
        let mut score = 0i32;

        if self.new_device {
            score += NEW_DEVICE;
        } else {
            if self.trusted_device {
                score += TRUSTED_DEVICE;
            }
            if self.user_agent_changed {
                score += USER_AGENT_CHANGED;
            }
        }

        if self.new_ip {
            score += NEW_IP;
        }

        let failures = self.recent_failures.max(0);
        score += failures.min(COUNTED_FAILURES) as i32 * PER_FAILURE;
        if failures > COUNTED_FAILURES {
            score += FAILURE_CLIFF;
        }

        if self.off_hours {
            score += OFF_HOURS;
        }

        match self.days_since_last_login {
            Some(days) if days > 30 => score += DORMANT_MONTH,
            Some(days) if days > 7 => score += DORMANT_WEEK,
            _ => {}
        }
        if self.first_login {
            score += FIRST_LOGIN;
        }

        score += i32::from(self.ip_reputation) * IP_REPUTATION_WEIGHT / 80;

        score.clamp(0, MAX_SCORE) as u8
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RiskAssessment {
    pub score: u8,
    pub factors: RiskFactors,
    #[serde(skip)]
    pub device_id: String,
}

pub struct RiskInput<'a> {
    pub user: &'a User,
    pub ip: IpAddr,
    pub user_agent: &'a str,
    pub device_id: &'a str,
}

/// Before 08:00 or from 22:00 UTC.
pub fn is_off_hours(at: DateTime<Utc>) -> bool {
    let hour = at.hour();
    !(8..22).contains(&hour)
}

/// Loopback, private, link-local and unique-local addresses.
pub fn is_local_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback() || v4.is_private() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_local_address(IpAddr::V4(v4));
            }
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
        }
    }
}

/// Reputation bucket from the number of recent failed logins seen from an IP.
pub fn reputation_for_failures(failures: i64) -> u8 {
    match failures {
        i64::MIN..=0 => 10,
        1..=5 => 20,
        6..=10 => 50,
        _ => 80,
    }
}

#[derive(Clone)]
pub struct RiskEngine {
    repo: Arc<dyn IdentityRepository>,
    store: Arc<dyn EphemeralStore>,
    clock: Arc<dyn Clock>,
    mfa_threshold: u8,
    failure_window: Duration,
}

impl RiskEngine {
    pub fn new(
        repo: Arc<dyn IdentityRepository>,
        store: Arc<dyn EphemeralStore>,
        clock: Arc<dyn Clock>,
        mfa_threshold: u8,
        failure_window: Duration,
    ) -> Self {
        Self {
            repo,
            store,
            clock,
            mfa_threshold,
            failure_window,
        }
    }

    pub fn should_require_mfa(&self, score: u8, _mfa_enabled: bool) -> bool {
        score >= self.mfa_threshold
    }

    pub async fn ip_reputation(&self, ip: IpAddr) -> Result<u8, ServiceError> {
        if is_local_address(ip) {
            return Ok(0);
        }
        let failures = self.store.counter(&keys::ip_failures(&ip.to_string())).await?;
        Ok(reputation_for_failures(failures))
    }

    pub async fn assess(&self, input: RiskInput<'_>) -> Result<RiskAssessment, ServiceError> {
        let now = self.clock.now();
        let user = input.user;
        let ip = input.ip.to_string();

        let device = self.repo.find_device(user.user_id, input.device_id).await?;
        let new_ip = !self.repo.has_successful_login_from_ip(user.user_id, &ip).await?;
        let recent_failures = self
            .repo
            .count_recent_failures(&user.username, now - self.failure_window)
            .await?;
        let ip_reputation = self.ip_reputation(input.ip).await?;

        let factors = RiskFactors {
            new_device: device.is_none(),
            trusted_device: device.as_ref().map(|d| d.trusted).unwrap_or(false),
            user_agent_changed: device
                .as_ref()
                .map(|d| d.user_agent != input.user_agent)
                .unwrap_or(false),
            new_ip,
            recent_failures,
            off_hours: is_off_hours(now),
            ip_reputation,
            days_since_last_login: user.last_login_utc.map(|last| (now - last).num_days()),
            first_login: user.last_login_utc.is_none(),
        };
        let score = factors.score();

        tracing::debug!(
            user_id = user.user_id,
            ip = %ip,
            risk_score = score,
            factors = ?factors,
            "Risk assessed"
        );

        Ok(RiskAssessment {
            score,
            factors,
            device_id: input.device_id.to_string(),
        })
    }

    /// Create or refresh the device record after a successful login.
    pub async fn record_device_login(
        &self,
        user_id: i64,
        device_id: &str,
        user_agent: &str,
        ip: IpAddr,
    ) -> Result<Device, ServiceError> {
        self.repo
            .record_device_login(user_id, device_id, user_agent, &ip.to_string(), self.clock.now())
            .await
    }
}
