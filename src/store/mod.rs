//! Member / check-in store collaborator.
//!
//! Handlers open one [`UnitOfWork`] per message. Writes are staged in the unit
//! and become visible to other readers only on [`UnitOfWork::commit`].

pub mod memory;
pub mod postgres;

use crate::types::member::{CheckinEvent, Member};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Optional time bounds for check-in queries, both inclusive
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckinWindow {
    pub from: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl CheckinWindow {
    pub fn between(from: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            until: Some(until),
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| ts >= from) && self.until.map_or(true, |until| ts <= until)
    }
}

/// Factory for units of work
#[async_trait]
pub trait MemberStore: Send + Sync {
    /// Open a new unit of work (database session + transaction)
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>>;
}

/// One transactional session against the store
#[async_trait]
pub trait UnitOfWork: Send {
    async fn fetch_member(&mut self, member_id: i64) -> Result<Option<Member>>;

    async fn fetch_checkins(
        &mut self,
        member_id: i64,
        window: Option<CheckinWindow>,
    ) -> Result<Vec<CheckinEvent>>;

    async fn list_members(&mut self) -> Result<Vec<Member>>;

    /// Set `risk_score` for each `(member_id, score)` pair
    async fn update_risk_scores(&mut self, scores: &[(i64, f64)]) -> Result<()>;

    async fn append_checkin(&mut self, checkin: &CheckinEvent) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}
