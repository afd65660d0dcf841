//! In-process store used by tests and dry runs

use super::{CheckinWindow, MemberStore, UnitOfWork};
use crate::types::member::{CheckinEvent, Member};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct MemoryState {
    members: BTreeMap<i64, Member>,
    checkins: Vec<CheckinEvent>,
    commits: u64,
}

/// Shared in-memory member store
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a member (stands in for the CRUD layer)
    pub fn insert_member(&self, member: Member) {
        if let Ok(mut state) = self.state.lock() {
            state.members.insert(member.id, member);
        }
    }

    /// Record a check-in directly, outside any unit of work
    pub fn insert_checkin(&self, checkin: CheckinEvent) {
        if let Ok(mut state) = self.state.lock() {
            state.checkins.push(checkin);
        }
    }

    pub fn member(&self, member_id: i64) -> Option<Member> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.members.get(&member_id).cloned())
    }

    pub fn checkins_for(&self, member_id: i64) -> Vec<CheckinEvent> {
        self.state
            .lock()
            .map(|state| {
                state
                    .checkins
                    .iter()
                    .filter(|c| c.member_id == member_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of committed units of work
    pub fn commit_count(&self) -> u64 {
        self.state.lock().map(|state| state.commits).unwrap_or(0)
    }
}

#[async_trait]
impl MemberStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        Ok(Box::new(MemoryUnitOfWork {
            state: self.state.clone(),
            staged_checkins: Vec::new(),
            staged_scores: Vec::new(),
        }))
    }
}

/// Unit of work that buffers writes until commit
struct MemoryUnitOfWork {
    state: Arc<Mutex<MemoryState>>,
    staged_checkins: Vec<CheckinEvent>,
    staged_scores: Vec<(i64, f64)>,
}

impl MemoryUnitOfWork {
    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|e| anyhow!("memory store lock poisoned: {}", e))
    }

    fn with_staged_score(&self, mut member: Member) -> Member {
        if let Some((_, score)) = self.staged_scores.iter().rev().find(|(id, _)| *id == member.id) {
            member.risk_score = *score;
        }
        member
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn fetch_member(&mut self, member_id: i64) -> Result<Option<Member>> {
        let member = self.lock()?.members.get(&member_id).cloned();
        Ok(member.map(|m| self.with_staged_score(m)))
    }

    async fn fetch_checkins(
        &mut self,
        member_id: i64,
        window: Option<CheckinWindow>,
    ) -> Result<Vec<CheckinEvent>> {
        let window = window.unwrap_or_default();
        let committed: Vec<CheckinEvent> = self
            .lock()?
            .checkins
            .iter()
            .filter(|c| c.member_id == member_id && window.contains(c.timestamp))
            .cloned()
            .collect();

        let staged = self
            .staged_checkins
            .iter()
            .filter(|c| c.member_id == member_id && window.contains(c.timestamp))
            .cloned();

        Ok(committed.into_iter().chain(staged).collect())
    }

    async fn list_members(&mut self) -> Result<Vec<Member>> {
        let members: Vec<Member> = self.lock()?.members.values().cloned().collect();
        Ok(members.into_iter().map(|m| self.with_staged_score(m)).collect())
    }

    async fn update_risk_scores(&mut self, scores: &[(i64, f64)]) -> Result<()> {
        self.staged_scores.extend_from_slice(scores);
        Ok(())
    }

    async fn append_checkin(&mut self, checkin: &CheckinEvent) -> Result<()> {
        self.staged_checkins.push(checkin.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut state = self.lock()?;
        state.checkins.extend(self.staged_checkins.iter().cloned());
        for (member_id, score) in &self.staged_scores {
            if let Some(member) = state.members.get_mut(member_id) {
                member.risk_score = *score;
            }
        }
        state.commits += 1;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_writes_invisible_until_commit() {
        let store = MemoryStore::new();
        store.insert_member(Member::new(1, "Ana", Utc::now()));

        let mut uow = store.begin().await.unwrap();
        uow.append_checkin(&CheckinEvent::new(1, Utc::now())).await.unwrap();
        uow.update_risk_scores(&[(1, 0.8)]).await.unwrap();

        // Read-your-writes inside the unit
        assert_eq!(uow.fetch_checkins(1, None).await.unwrap().len(), 1);
        assert_eq!(uow.fetch_member(1).await.unwrap().unwrap().risk_score, 0.8);
        // Nothing visible outside yet
        assert!(store.checkins_for(1).is_empty());
        assert_eq!(store.member(1).unwrap().risk_score, 0.0);

        uow.commit().await.unwrap();
        assert_eq!(store.checkins_for(1).len(), 1);
        assert_eq!(store.member(1).unwrap().risk_score, 0.8);
        assert_eq!(store.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let store = MemoryStore::new();
        store.insert_member(Member::new(1, "Ana", Utc::now()));

        let mut uow = store.begin().await.unwrap();
        uow.append_checkin(&CheckinEvent::new(1, Utc::now())).await.unwrap();
        uow.rollback().await.unwrap();

        assert!(store.checkins_for(1).is_empty());
        assert_eq!(store.commit_count(), 0);
    }
}
