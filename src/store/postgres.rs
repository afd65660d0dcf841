//! PostgreSQL store over the membership service's tables.
//!
//! Reads `alunos` (members), `planos` (plans) and `checkins`; writes only
//! `checkins` rows and `alunos.risco_churn`.

use super::{CheckinWindow, MemberStore, UnitOfWork};
use crate::types::member::{CheckinEvent, Member};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use tracing::info;

const MEMBER_COLUMNS: &str = "a.id::int8 AS id, a.nome, a.data_matricula, a.data_cancelamento, \
     p.preco::float8 AS preco, COALESCE(a.risco_churn, 0)::float8 AS risco_churn \
     FROM alunos a LEFT JOIN planos p ON p.id = a.plano_id";

/// Connection pool wrapper; each unit of work is one transaction
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to the database
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;
        info!(max_connections = max_connections, "Connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl MemberStore for PgStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        let tx = self.pool.begin().await.context("Failed to open transaction")?;
        Ok(Box::new(PgUnitOfWork { tx }))
    }
}

struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

fn member_from_row(row: &PgRow) -> Result<Member> {
    let enrolled: Option<NaiveDateTime> = row.try_get("data_matricula")?;
    let cancelled: Option<NaiveDateTime> = row.try_get("data_cancelamento")?;
    Ok(Member {
        id: row.try_get("id")?,
        name: row.try_get::<Option<String>, _>("nome")?.unwrap_or_default(),
        enrolled_at: enrolled.map(|ts| ts.and_utc()),
        cancelled_at: cancelled.map(|ts| ts.and_utc()),
        plan_price: row.try_get("preco")?,
        risk_score: row.try_get("risco_churn")?,
    })
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn fetch_member(&mut self, member_id: i64) -> Result<Option<Member>> {
        let query = format!("SELECT {MEMBER_COLUMNS} WHERE a.id = $1");
        let row = sqlx::query(&query)
            .bind(member_id)
            .fetch_optional(&mut *self.tx)
            .await
            .context("Failed to fetch member")?;
        row.as_ref().map(member_from_row).transpose()
    }

    async fn fetch_checkins(
        &mut self,
        member_id: i64,
        window: Option<CheckinWindow>,
    ) -> Result<Vec<CheckinEvent>> {
        let window = window.unwrap_or_default();
        let rows = sqlx::query(
            r#"
            SELECT data FROM checkins
            WHERE aluno_id = $1
              AND ($2::timestamp IS NULL OR data >= $2)
              AND ($3::timestamp IS NULL OR data <= $3)
            ORDER BY data
            "#,
        )
        .bind(member_id)
        .bind(window.from.map(|ts| ts.naive_utc()))
        .bind(window.until.map(|ts| ts.naive_utc()))
        .fetch_all(&mut *self.tx)
        .await
        .context("Failed to fetch check-ins")?;

        rows.iter()
            .map(|row| {
                let data: NaiveDateTime = row.try_get("data")?;
                Ok(CheckinEvent::new(member_id, data.and_utc()))
            })
            .collect()
    }

    async fn list_members(&mut self) -> Result<Vec<Member>> {
        let query = format!("SELECT {MEMBER_COLUMNS} ORDER BY a.id");
        let rows = sqlx::query(&query)
            .fetch_all(&mut *self.tx)
            .await
            .context("Failed to list members")?;
        rows.iter().map(member_from_row).collect()
    }

    async fn update_risk_scores(&mut self, scores: &[(i64, f64)]) -> Result<()> {
        if scores.is_empty() {
            return Ok(());
        }
        let ids: Vec<i64> = scores.iter().map(|(id, _)| *id).collect();
        let values: Vec<f64> = scores.iter().map(|(_, score)| *score).collect();

        sqlx::query(
            r#"
            UPDATE alunos SET risco_churn = s.score
            FROM UNNEST($1::int8[], $2::float8[]) AS s(id, score)
            WHERE alunos.id = s.id
            "#,
        )
        .bind(&ids)
        .bind(&values)
        .execute(&mut *self.tx)
        .await
        .context("Failed to update risk scores")?;
        Ok(())
    }

    async fn append_checkin(&mut self, checkin: &CheckinEvent) -> Result<()> {
        sqlx::query("INSERT INTO checkins (aluno_id, data) VALUES ($1, $2)")
            .bind(checkin.member_id)
            .bind(checkin.timestamp.naive_utc())
            .execute(&mut *self.tx)
            .await
            .context("Failed to insert check-in")?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.context("Failed to commit transaction")
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.context("Failed to roll back transaction")
    }
}
