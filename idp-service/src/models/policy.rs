//! Conditional access policies.
//!
//! Conditions are a closed set of typed categories. A policy is validated when
//! it is constructed (admin save or repository load), so evaluation never has
//! to deal with malformed rules. A category that is absent from a policy is a
//! wildcard on that dimension.

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum PolicyError {
    #[error("Policy name is required")]
    MissingName,

    #[error("Condition category '{0}' appears more than once")]
    DuplicateCategory(&'static str),

    #[error("Condition category '{0}' has no values; omit it to match everything")]
    EmptyCondition(&'static str),

    #[error("Invalid time window {start}..{end}")]
    InvalidTimeWindow { start: u32, end: u32 },

    #[error("Risk threshold {0} is outside 0..=100")]
    InvalidRiskThreshold(u8),

    #[error("Policy must declare at least one action")]
    NoAction,

    #[error("A policy cannot both block and allow")]
    ConflictingActions,

    #[error("Session duration override must be positive")]
    InvalidSessionDuration,
}

/// Everything a policy can be matched against.
#[derive(Debug, Clone)]
pub struct AccessContext {
    pub user_id: i64,
    pub app_id: Option<String>,
    pub ip: IpAddr,
    pub user_agent: String,
    pub roles: Vec<String>,
    pub at: DateTime<Utc>,
    pub risk_score: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserCondition {
    #[serde(default)]
    pub user_ids: Vec<i64>,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppCondition {
    pub app_ids: Vec<String>,
}

/// Exact addresses are written without a prefix and parse as host networks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpCondition {
    pub networks: Vec<IpNetwork>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCondition {
    pub user_agent_contains: Vec<String>,
}

/// Hour window in UTC, `start_hour <= h < end_hour`; wraps midnight when
/// `start_hour > end_hour`. An empty weekday list means every day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeCondition {
    #[serde(default)]
    pub weekdays: Vec<Weekday>,
    pub start_hour: u32,
    pub end_hour: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskCondition {
    pub min_score: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    User(UserCondition),
    App(AppCondition),
    Ip(IpCondition),
    Device(DeviceCondition),
    Time(TimeCondition),
    Risk(RiskCondition),
}

impl Condition {
    pub fn category(&self) -> &'static str {
        match self {
            Condition::User(_) => "user",
            Condition::App(_) => "app",
            Condition::Ip(_) => "ip",
            Condition::Device(_) => "device",
            Condition::Time(_) => "time",
            Condition::Risk(_) => "risk",
        }
    }

    fn validate(&self) -> Result<(), PolicyError> {
        let empty = match self {
            Condition::User(c) => c.user_ids.is_empty() && c.roles.is_empty(),
            Condition::App(c) => c.app_ids.is_empty(),
            Condition::Ip(c) => c.networks.is_empty(),
            Condition::Device(c) => c.user_agent_contains.is_empty(),
            Condition::Time(c) => {
                if c.start_hour > 23 || c.end_hour > 24 || c.start_hour == c.end_hour {
                    return Err(PolicyError::InvalidTimeWindow {
                        start: c.start_hour,
                        end: c.end_hour,
                    });
                }
                false
            }
            Condition::Risk(c) => {
                if c.min_score > 100 {
                    return Err(PolicyError::InvalidRiskThreshold(c.min_score));
                }
                false
            }
        };
        if empty {
            return Err(PolicyError::EmptyCondition(self.category()));
        }
        Ok(())
    }

    pub fn matches(&self, ctx: &AccessContext) -> bool {
        match self {
            Condition::User(c) => {
                c.user_ids.contains(&ctx.user_id) || c.roles.iter().any(|r| ctx.roles.contains(r))
            }
            Condition::App(c) => ctx
                .app_id
                .as_ref()
                .map(|app| c.app_ids.contains(app))
                .unwrap_or(false),
            Condition::Ip(c) => c.networks.iter().any(|net| net.contains(ctx.ip)),
            Condition::Device(c) => {
                let ua = ctx.user_agent.to_lowercase();
                c.user_agent_contains
                    .iter()
                    .any(|needle| ua.contains(&needle.to_lowercase()))
            }
            Condition::Time(c) => {
                if !c.weekdays.is_empty() && !c.weekdays.contains(&ctx.at.weekday()) {
                    return false;
                }
                let hour = ctx.at.hour();
                if c.start_hour < c.end_hour {
                    hour >= c.start_hour && hour < c.end_hour
                } else {
                    hour >= c.start_hour || hour < c.end_hour
                }
            }
            Condition::Risk(c) => ctx.risk_score.map(|s| s >= c.min_score).unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyActions {
    #[serde(default)]
    pub block: bool,
    #[serde(default)]
    pub allow: bool,
    #[serde(default)]
    pub require_mfa: bool,
    #[serde(default)]
    pub require_password_change: bool,
    /// Minutes; replaces the access token lifetime and session expiry.
    #[serde(default)]
    pub session_duration_override: Option<i64>,
}

impl PolicyActions {
    pub fn block() -> Self {
        Self {
            block: true,
            ..Default::default()
        }
    }

    pub fn allow() -> Self {
        Self {
            allow: true,
            ..Default::default()
        }
    }

    pub fn require_mfa() -> Self {
        Self {
            require_mfa: true,
            ..Default::default()
        }
    }

    fn validate(&self) -> Result<(), PolicyError> {
        if self.block && self.allow {
            return Err(PolicyError::ConflictingActions);
        }
        if matches!(self.session_duration_override, Some(m) if m <= 0) {
            return Err(PolicyError::InvalidSessionDuration);
        }
        let any = self.block
            || self.allow
            || self.require_mfa
            || self.require_password_change
            || self.session_duration_override.is_some();
        if !any {
            return Err(PolicyError::NoAction);
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ConditionalAccessPolicy {
    pub policy_id: i64,
    pub name: String,
    pub priority: i32,
    pub enabled: bool,
    pub created_utc: DateTime<Utc>,
    conditions: Vec<Condition>,
    actions: PolicyActions,
}

impl ConditionalAccessPolicy {
    /// Build a validated, enabled policy. The id is assigned by the repository.
    pub fn new(
        name: &str,
        priority: i32,
        conditions: Vec<Condition>,
        actions: PolicyActions,
    ) -> Result<Self, PolicyError> {
        if name.trim().is_empty() {
            return Err(PolicyError::MissingName);
        }
        let mut seen: Vec<&'static str> = Vec::new();
        for condition in &conditions {
            let category = condition.category();
            if seen.contains(&category) {
                return Err(PolicyError::DuplicateCategory(category));
            }
            seen.push(category);
            condition.validate()?;
        }
        actions.validate()?;

        Ok(Self {
            policy_id: 0,
            name: name.to_string(),
            priority,
            enabled: true,
            created_utc: Utc::now(),
            conditions,
            actions,
        })
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn actions(&self) -> &PolicyActions {
        &self.actions
    }

    /// Every present category must match.
    pub fn matches(&self, ctx: &AccessContext) -> bool {
        self.conditions.iter().all(|c| c.matches(ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ctx(ip: &str, hour: u32) -> AccessContext {
        AccessContext {
            user_id: 7,
            app_id: Some("crm".to_string()),
            ip: ip.parse().unwrap(),
            user_agent: "Mozilla/5.0 (X11; Linux x86_64) Firefox/128.0".to_string(),
            roles: vec!["staff".to_string()],
            // 2024-06-05 is a Wednesday
            at: Utc.with_ymd_and_hms(2024, 6, 5, hour, 30, 0).unwrap(),
            risk_score: Some(40),
        }
    }

    #[test]
    fn test_conditions_parse_from_tagged_json() {
        let json = r#"[
            {"type": "ip", "networks": ["10.0.0.0/8", "203.0.113.7"]},
            {"type": "time", "weekdays": ["Sat", "Sun"], "start_hour": 0, "end_hour": 24},
            {"type": "user", "roles": ["contractor"]}
        ]"#;
        let conditions: Vec<Condition> = serde_json::from_str(json).unwrap();
        assert_eq!(conditions.len(), 3);
        assert!(
            ConditionalAccessPolicy::new("weekend", 10, conditions, PolicyActions::block()).is_ok()
        );
    }

    #[test]
    fn test_unknown_condition_type_is_rejected_at_parse() {
        let json = r#"{"type": "geo", "countries": ["XX"]}"#;
        assert!(serde_json::from_str::<Condition>(json).is_err());
    }

    #[test]
    fn test_invalid_cidr_is_rejected_at_parse() {
        let json = r#"{"type": "ip", "networks": ["10.0.0.0/99"]}"#;
        assert!(serde_json::from_str::<Condition>(json).is_err());
    }

    #[test]
    fn test_validation_errors() {
        let dup = vec![
            Condition::App(AppCondition { app_ids: vec!["a".into()] }),
            Condition::App(AppCondition { app_ids: vec!["b".into()] }),
        ];
        assert_eq!(
            ConditionalAccessPolicy::new("dup", 1, dup, PolicyActions::block()).unwrap_err(),
            PolicyError::DuplicateCategory("app")
        );

        let empty = vec![Condition::Ip(IpCondition { networks: vec![] })];
        assert_eq!(
            ConditionalAccessPolicy::new("empty", 1, empty, PolicyActions::block()).unwrap_err(),
            PolicyError::EmptyCondition("ip")
        );

        let window = vec![Condition::Time(TimeCondition {
            weekdays: vec![],
            start_hour: 9,
            end_hour: 9,
        })];
        assert!(matches!(
            ConditionalAccessPolicy::new("window", 1, window, PolicyActions::block()),
            Err(PolicyError::InvalidTimeWindow { .. })
        ));

        assert_eq!(
            ConditionalAccessPolicy::new("none", 1, vec![], PolicyActions::default()).unwrap_err(),
            PolicyError::NoAction
        );

        let both = PolicyActions {
            block: true,
            allow: true,
            ..Default::default()
        };
        assert_eq!(
            ConditionalAccessPolicy::new("both", 1, vec![], both).unwrap_err(),
            PolicyError::ConflictingActions
        );
    }

    #[test]
    fn test_ip_condition_exact_and_cidr() {
        let cond = Condition::Ip(IpCondition {
            networks: vec!["10.0.0.0/8".parse().unwrap(), "203.0.113.7".parse().unwrap()],
        });
        assert!(cond.matches(&ctx("10.20.30.40", 12)));
        assert!(cond.matches(&ctx("203.0.113.7", 12)));
        assert!(!cond.matches(&ctx("203.0.113.8", 12)));
    }

    #[test]
    fn test_time_condition_wraps_midnight() {
        let cond = Condition::Time(TimeCondition {
            weekdays: vec![],
            start_hour: 22,
            end_hour: 6,
        });
        assert!(cond.matches(&ctx("10.0.0.1", 23)));
        assert!(cond.matches(&ctx("10.0.0.1", 3)));
        assert!(!cond.matches(&ctx("10.0.0.1", 12)));
    }

    #[test]
    fn test_time_condition_weekday_filter() {
        let cond = Condition::Time(TimeCondition {
            weekdays: vec![Weekday::Sat, Weekday::Sun],
            start_hour: 0,
            end_hour: 24,
        });
        assert!(!cond.matches(&ctx("10.0.0.1", 12)));
    }

    #[test]
    fn test_user_condition_matches_role_or_id() {
        let by_role = Condition::User(UserCondition {
            user_ids: vec![],
            roles: vec!["staff".into()],
        });
        let by_id = Condition::User(UserCondition {
            user_ids: vec![7],
            roles: vec![],
        });
        let other = Condition::User(UserCondition {
            user_ids: vec![8],
            roles: vec!["admin".into()],
        });
        let c = ctx("10.0.0.1", 12);
        assert!(by_role.matches(&c));
        assert!(by_id.matches(&c));
        assert!(!other.matches(&c));
    }

    #[test]
    fn test_device_and_risk_conditions() {
        let device = Condition::Device(DeviceCondition {
            user_agent_contains: vec!["firefox".into()],
        });
        let risky = Condition::Risk(RiskCondition { min_score: 50 });
        let c = ctx("10.0.0.1", 12);
        assert!(device.matches(&c));
        assert!(!risky.matches(&c));
    }

    #[test]
    fn test_policy_without_conditions_matches_everything() {
        let policy =
            ConditionalAccessPolicy::new("all", 1, vec![], PolicyActions::require_mfa()).unwrap();
        assert!(policy.matches(&ctx("192.0.2.1", 2)));
    }
}
