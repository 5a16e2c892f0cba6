//! Default warming strategies and ad-hoc query sets

use crate::cache::CacheTier;
use crate::warming::executor::WarmingQuery;
use crate::warming::strategy::{Schedule, WarmingStrategy};
use std::time::Duration;

pub const STARTUP_STRATEGY: &str = "startup";
pub const FREQUENT_STRATEGY: &str = "frequent";
pub const HOURLY_ANALYTICS_STRATEGY: &str = "hourly-analytics";
pub const DAILY_REPORTS_STRATEGY: &str = "daily-reports";

/// Strategies registered by [`WarmingScheduler::with_default_strategies`](crate::warming::WarmingScheduler::with_default_strategies)
pub fn default_strategies() -> Vec<WarmingStrategy> {
    vec![
        WarmingStrategy::new(STARTUP_STRATEGY, Schedule::OnStartup)
            .priority(1)
            .query(
                WarmingQuery::new(
                    "MATCH (p:Project) WHERE p.status = 'active' \
                     RETURN p ORDER BY p.updatedAt DESC LIMIT 50",
                    "active projects",
                )
                .tier(CacheTier::Warm),
            )
            .query(
                WarmingQuery::new(
                    "MATCH (p:Project)-[:HAS_REQUIREMENT]->(r:Requirement) \
                     RETURN p.id AS projectId, count(r) AS requirementCount",
                    "requirement counts per project",
                )
                .tier(CacheTier::Warm),
            ),
        WarmingStrategy::new(FREQUENT_STRATEGY, Schedule::Every(Duration::from_secs(5 * 60)))
            .priority(2)
            .query(
                WarmingQuery::new(
                    "MATCH (r:Requirement) RETURN r ORDER BY r.updatedAt DESC LIMIT 100",
                    "recently updated requirements",
                )
                .tier(CacheTier::Hot),
            )
            .query(
                WarmingQuery::new(
                    "MATCH (r:Requirement) WHERE r.status = 'in_review' RETURN r LIMIT 100",
                    "requirements in review",
                )
                .tier(CacheTier::Hot),
            ),
        WarmingStrategy::new(HOURLY_ANALYTICS_STRATEGY, Schedule::Cron("0 * * * *".to_string()))
            .priority(3)
            .query(
                WarmingQuery::new(
                    "MATCH (r:Requirement) RETURN r.status AS status, count(r) AS total",
                    "requirement status distribution",
                )
                .tier(CacheTier::Warm),
            )
            .query(
                WarmingQuery::new(
                    "MATCH (s:Stakeholder)-[:OWNS]->(r:Requirement) \
                     RETURN s.id AS stakeholderId, count(r) AS owned",
                    "requirements per stakeholder",
                )
                .tier(CacheTier::Warm),
            ),
        WarmingStrategy::new(DAILY_REPORTS_STRATEGY, Schedule::Cron("0 2 * * *".to_string()))
            .priority(4)
            .query(
                WarmingQuery::new(
                    "MATCH (a:ArchitectureDecision) RETURN a.status AS status, count(a) AS total",
                    "architecture decision summary",
                )
                .tier(CacheTier::Cold),
            )
            .query(
                WarmingQuery::new(
                    "MATCH (r:Requirement) WHERE NOT (r)<-[:SATISFIES]-(:ArchitectureDecision) \
                     RETURN r.id AS id, r.title AS title",
                    "requirements without architecture coverage",
                )
                .tier(CacheTier::Cold),
            ),
    ]
}

/// Queries primed when a project is created or opened
pub fn project_queries(project_id: &str) -> Vec<WarmingQuery> {
    vec![
        WarmingQuery::new("MATCH (p:Project {id: $projectId}) RETURN p", "project")
            .param("projectId", project_id)
            .tier(CacheTier::Warm),
        WarmingQuery::new(
            "MATCH (p:Project {id: $projectId})-[:HAS_REQUIREMENT]->(r:Requirement) RETURN r",
            "project requirements",
        )
        .param("projectId", project_id)
        .tier(CacheTier::Hot),
        WarmingQuery::new(
            "MATCH (p:Project {id: $projectId})-[:HAS_DECISION]->(a:ArchitectureDecision) RETURN a",
            "project architecture decisions",
        )
        .param("projectId", project_id)
        .tier(CacheTier::Warm),
        WarmingQuery::new(
            "MATCH (p:Project {id: $projectId})<-[:MEMBER_OF]-(s:Stakeholder) RETURN s",
            "project stakeholders",
        )
        .param("projectId", project_id)
        .tier(CacheTier::Warm),
    ]
}

/// Queries primed when a user signs in
pub fn user_queries(user_id: &str) -> Vec<WarmingQuery> {
    vec![
        WarmingQuery::new(
            "MATCH (u:User {id: $userId})-[:MEMBER_OF]->(p:Project) RETURN p",
            "user projects",
        )
        .param("userId", user_id)
        .tier(CacheTier::Warm),
        WarmingQuery::new(
            "MATCH (u:User {id: $userId})-[:ASSIGNED_TO]->(r:Requirement) RETURN r",
            "user assigned requirements",
        )
        .param("userId", user_id)
        .tier(CacheTier::Hot),
    ]
}
