use serde::Serialize;
use std::sync::Arc;

use crate::models::{AccessContext, ConditionalAccessPolicy};
use crate::services::{IdentityRepository, ServiceError};

/// Combined outcome of every matching policy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccessDecision {
    pub allow: bool,
    pub require_mfa: bool,
    pub require_password_change: bool,
    /// Minutes
    pub session_duration_override: Option<i64>,
    /// Name of the policy that blocked access
    pub block_reason: Option<String>,
    pub matched_policies: Vec<String>,
}

impl Default for AccessDecision {
    fn default() -> Self {
        Self {
            allow: true,
            require_mfa: false,
            require_password_change: false,
            session_duration_override: None,
            block_reason: None,
            matched_policies: Vec::new(),
        }
    }
}

impl AccessDecision {
    pub fn is_blocked(&self) -> bool {
        self.block_reason.is_some()
    }
}

/// Evaluate policies against a context. Policies are considered in
/// descending priority (stable for ties); the first matching block ends
/// evaluation.
pub fn evaluate_policies(
    policies: &[ConditionalAccessPolicy],
    ctx: &AccessContext,
) -> AccessDecision {
    let mut ordered: Vec<&ConditionalAccessPolicy> =
        policies.iter().filter(|p| p.enabled).collect();
    ordered.sort_by(|a, b| b.priority.cmp(&a.priority));

    let mut decision = AccessDecision::default();
    for policy in ordered {
        if !policy.matches(ctx) {
            continue;
        }
        decision.matched_policies.push(policy.name.clone());
        let actions = policy.actions();

        if actions.block {
            decision.allow = false;
            decision.block_reason = Some(policy.name.clone());
            return decision;
        }

        decision.require_mfa |= actions.require_mfa;
        decision.require_password_change |= actions.require_password_change;
        if let Some(minutes) = actions.session_duration_override.filter(|m| *m > 0) {
            decision.session_duration_override = Some(minutes);
        }
    }
    decision
}

#[derive(Clone)]
pub struct ConditionalAccessEvaluator {
    repo: Arc<dyn IdentityRepository>,
}

impl ConditionalAccessEvaluator {
    pub fn new(repo: Arc<dyn IdentityRepository>) -> Self {
        Self { repo }
    }

    pub async fn evaluate(&self, ctx: &AccessContext) -> Result<AccessDecision, ServiceError> {
        let policies = self.repo.list_enabled_policies().await?;
        let decision = evaluate_policies(&policies, ctx);

        if let Some(reason) = &decision.block_reason {
            tracing::info!(
                user_id = ctx.user_id,
                app_id = ?ctx.app_id,
                ip = %ctx.ip,
                policy = %reason,
                "Access blocked by conditional access policy"
            );
        } else if !decision.matched_policies.is_empty() {
            tracing::debug!(
                user_id = ctx.user_id,
                matched = ?decision.matched_policies,
                require_mfa = decision.require_mfa,
                "Conditional access policies matched"
            );
        }

        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::policy::{AppCondition, IpCondition, TimeCondition, UserCondition};
    use crate::models::{Condition, PolicyActions};
    use crate::services::InMemoryRepository;
    use chrono::{TimeZone, Utc, Weekday};

    fn ctx() -> AccessContext {
        AccessContext {
            user_id: 7,
            app_id: Some("crm".to_string()),
            ip: "10.1.2.3".parse().unwrap(),
            user_agent: "Mozilla/5.0".to_string(),
            roles: vec!["contractor".to_string()],
            // Saturday
            at: Utc.with_ymd_and_hms(2024, 6, 8, 14, 0, 0).unwrap(),
            risk_score: Some(20),
        }
    }

    fn policy(
        name: &str,
        priority: i32,
        conditions: Vec<Condition>,
        actions: PolicyActions,
    ) -> ConditionalAccessPolicy {
        ConditionalAccessPolicy::new(name, priority, conditions, actions).unwrap()
    }

    #[test]
    fn test_no_policies_allows() {
        let decision = evaluate_policies(&[], &ctx());
        assert_eq!(decision, AccessDecision::default());
        assert!(decision.allow);
    }

    #[test]
    fn test_block_wins_regardless_of_list_order() {
        let allow = policy("allow all", 1, vec![], PolicyActions::allow());
        let block = policy(
            "block crm",
            100,
            vec![Condition::App(AppCondition {
                app_ids: vec!["crm".into()],
            })],
            PolicyActions::block(),
        );

        for policies in [vec![allow.clone(), block.clone()], vec![block.clone(), allow.clone()]] {
            let decision = evaluate_policies(&policies, &ctx());
            assert!(!decision.allow);
            assert_eq!(decision.block_reason.as_deref(), Some("block crm"));
        }
    }

    #[test]
    fn test_block_short_circuits_lower_priorities() {
        let block = policy("weekend block", 50, vec![Condition::Time(TimeCondition {
            weekdays: vec![Weekday::Sat, Weekday::Sun],
            start_hour: 0,
            end_hour: 24,
        })], PolicyActions::block());
        let mfa = policy("mfa", 10, vec![], PolicyActions::require_mfa());

        let decision = evaluate_policies(&[mfa, block], &ctx());
        assert!(decision.is_blocked());
        assert!(!decision.require_mfa);
        assert_eq!(decision.matched_policies, vec!["weekend block".to_string()]);
    }

    #[test]
    fn test_non_blocking_actions_accumulate() {
        let mfa = policy("contractors need mfa", 20, vec![Condition::User(UserCondition {
            user_ids: vec![],
            roles: vec!["contractor".into()],
        })], PolicyActions::require_mfa());
        let short_session = policy("short", 10, vec![], PolicyActions {
            session_duration_override: Some(30),
            ..Default::default()
        });
        let rotate = policy("rotate", 5, vec![Condition::Ip(IpCondition {
            networks: vec!["10.0.0.0/8".parse().unwrap()],
        })], PolicyActions {
            require_password_change: true,
            session_duration_override: Some(10),
            ..Default::default()
        });

        let decision = evaluate_policies(&[short_session, rotate, mfa], &ctx());
        assert!(decision.allow);
        assert!(decision.require_mfa);
        assert!(decision.require_password_change);
        // Last override in priority order wins
        assert_eq!(decision.session_duration_override, Some(10));
    }

    #[test]
    fn test_non_matching_policy_is_ignored() {
        let block = policy("block other app", 100, vec![Condition::App(AppCondition {
            app_ids: vec!["payroll".into()],
        })], PolicyActions::block());
        assert!(evaluate_policies(&[block.clone()], &ctx()).allow);

        let mut no_app = ctx();
        no_app.app_id = None;
        assert!(evaluate_policies(&[block], &no_app).allow);
    }

    #[test]
    fn test_disabled_policy_is_skipped() {
        let mut block = policy("block", 100, vec![], PolicyActions::block());
        block.enabled = false;
        assert!(evaluate_policies(&[block], &ctx()).allow);
    }

    #[tokio::test]
    async fn test_evaluator_loads_from_repository() {
        let repo = Arc::new(InMemoryRepository::new());
        repo.insert_policy(&policy("allow", 1, vec![], PolicyActions::allow()))
            .await
            .unwrap();
        repo.insert_policy(&policy("block", 100, vec![], PolicyActions::block()))
            .await
            .unwrap();

        let evaluator = ConditionalAccessEvaluator::new(repo);
        let decision = evaluator.evaluate(&ctx()).await.unwrap();
        assert_eq!(decision.block_reason.as_deref(), Some("block"));
    }
}
