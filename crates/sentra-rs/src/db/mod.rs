use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{migrate::Migrator, QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    RemediationReport, RiskLabel, ScanPatch, ScanSession, ScanStatus, StageRecord, ToolRun,
};

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

pub async fn create_pool(url: &str) -> anyhow::Result<SqlitePool> {
    Ok(SqlitePool::connect(url).await?)
}

pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    MIGRATOR.run(pool).await?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("scan {0} does not exist")]
    Missing(Uuid),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Durable mirror of scan sessions.
#[async_trait]
pub trait ScanStore: Send + Sync {
    async fn upsert(&self, session: &ScanSession) -> Result<(), StoreError>;
    /// Writes only the fields present in `patch`.
    async fn update(&self, id: Uuid, patch: &ScanPatch) -> Result<(), StoreError>;
    async fn get(&self, id: Uuid) -> Result<Option<ScanSession>, StoreError>;
    async fn list_recent(&self, limit: i64) -> Result<Vec<ScanSession>, StoreError>;
    /// Ids of sessions whose status is neither complete nor failed.
    async fn list_unfinished(&self) -> Result<Vec<Uuid>, StoreError>;
    async fn delete(&self, id: Uuid) -> Result<bool, StoreError>;
}

#[derive(Debug, sqlx::FromRow)]
struct ScanRow {
    id: String,
    target: String,
    status: String,
    scan_stage: String,
    analysis: Option<String>,
    fixes: Option<String>,
    risk_score: Option<f64>,
    risk_label: Option<String>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, sqlx::FromRow)]
struct StageRow {
    stage: String,
    ordinal: i64,
    entered_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SqliteScanStore {
    pool: SqlitePool,
}

impl SqliteScanStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn hydrate(&self, row: ScanRow) -> Result<ScanSession, StoreError> {
        let runs = sqlx::query_as::<_, (String, String)>(
            "SELECT tool, output FROM tool_runs WHERE scan_id = ? ORDER BY position",
        )
        .bind(&row.id)
        .fetch_all(&self.pool)
        .await?;

        let stages = sqlx::query_as::<_, StageRow>(
            "SELECT stage, ordinal, entered_at FROM stage_history WHERE scan_id = ? ORDER BY seq",
        )
        .bind(&row.id)
        .fetch_all(&self.pool)
        .await?;

        let scan_id = Uuid::parse_str(&row.id).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let status = ScanStatus::parse(&row.status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown status {}", row.status)))?;
        let fixes = row
            .fixes
            .as_deref()
            .map(serde_json::from_str::<RemediationReport>)
            .transpose()?;
        let risk_label = row.risk_label.as_deref().and_then(RiskLabel::parse);

        Ok(ScanSession {
            scan_id,
            target: row.target,
            status,
            scan_stage: row.scan_stage,
            tools_used: runs.iter().map(|(tool, _)| tool.clone()).collect(),
            outputs: runs
                .into_iter()
                .map(|(tool, output)| ToolRun { tool, output })
                .collect(),
            analysis: row.analysis,
            fixes,
            risk_score: row.risk_score.filter(|_| risk_label.is_some()),
            risk_label,
            error: row.error,
            stage_history: stages
                .into_iter()
                .map(|s| StageRecord {
                    stage: s.stage,
                    ordinal: s.ordinal,
                    entered_at: s.entered_at,
                })
                .collect(),
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }
}

async fn insert_tool_run(
    conn: &mut SqliteConnection,
    id: &str,
    run: &ToolRun,
) -> Result<(), sqlx::Error> {
    // write-once per tool; position is the insertion order
    sqlx::query(
        "INSERT OR IGNORE INTO tool_runs(scan_id, position, tool, output) \
         VALUES(?, (SELECT COUNT(*) FROM tool_runs WHERE scan_id = ?), ?, ?)",
    )
    .bind(id)
    .bind(id)
    .bind(&run.tool)
    .bind(&run.output)
    .execute(conn)
    .await?;
    Ok(())
}

async fn insert_stage(
    conn: &mut SqliteConnection,
    id: &str,
    stage: &StageRecord,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO stage_history(scan_id, seq, stage, ordinal, entered_at) \
         VALUES(?, (SELECT COALESCE(MAX(seq), -1) + 1 FROM stage_history WHERE scan_id = ?), ?, ?, ?)",
    )
    .bind(id)
    .bind(id)
    .bind(&stage.stage)
    .bind(stage.ordinal)
    .bind(stage.entered_at)
    .execute(conn)
    .await?;
    Ok(())
}

#[async_trait]
impl ScanStore for SqliteScanStore {
    async fn upsert(&self, session: &ScanSession) -> Result<(), StoreError> {
        let id = session.scan_id.to_string();
        let fixes = session
            .fixes
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO scans(id, target, status, scan_stage, analysis, fixes, risk_score, risk_label, error, created_at, completed_at) \
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET target = excluded.target, status = excluded.status, \
             scan_stage = excluded.scan_stage, analysis = excluded.analysis, fixes = excluded.fixes, \
             risk_score = excluded.risk_score, risk_label = excluded.risk_label, error = excluded.error, \
             completed_at = excluded.completed_at",
        )
        .bind(&id)
        .bind(&session.target)
        .bind(session.status.as_str())
        .bind(&session.scan_stage)
        .bind(&session.analysis)
        .bind(fixes)
        .bind(session.risk_score)
        .bind(session.risk_label.map(|l| l.as_str()))
        .bind(&session.error)
        .bind(session.created_at)
        .bind(session.completed_at)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM tool_runs WHERE scan_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        for run in &session.outputs {
            insert_tool_run(&mut tx, &id, run).await?;
        }

        sqlx::query("DELETE FROM stage_history WHERE scan_id = ?")
            .bind(&id)
            .execute(&mut *tx)
            .await?;
        for stage in &session.stage_history {
            insert_stage(&mut tx, &id, stage).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn update(&self, id: Uuid, patch: &ScanPatch) -> Result<(), StoreError> {
        let key = id.to_string();
        let fixes = patch.fixes.as_ref().map(serde_json::to_string).transpose()?;

        // `id = id` keeps the SET list valid when the patch only appends rows
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE scans SET id = id");
        if let Some(status) = patch.status {
            qb.push(", status = ");
            qb.push_bind(status.as_str());
        }
        if let Some(stage) = &patch.stage {
            qb.push(", scan_stage = ");
            qb.push_bind(stage.stage.clone());
        }
        if let Some(analysis) = &patch.analysis {
            qb.push(", analysis = ");
            qb.push_bind(analysis.clone());
        }
        if let Some(fixes) = fixes {
            qb.push(", fixes = ");
            qb.push_bind(fixes);
        }
        if let Some(risk) = patch.risk {
            qb.push(", risk_score = ");
            qb.push_bind(risk.score);
            qb.push(", risk_label = ");
            qb.push_bind(risk.label.as_str());
        }
        if let Some(error) = &patch.error {
            qb.push(", error = ");
            qb.push_bind(error.clone());
        }
        if let Some(at) = patch.completed_at {
            qb.push(", completed_at = ");
            qb.push_bind(at);
        }
        qb.push(" WHERE id = ");
        qb.push_bind(key.clone());

        let mut tx = self.pool.begin().await?;
        let result = qb.build().execute(&mut *tx).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Missing(id));
        }
        if let Some(run) = &patch.tool_run {
            insert_tool_run(&mut tx, &key, run).await?;
        }
        if let Some(stage) = &patch.stage {
            insert_stage(&mut tx, &key, stage).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ScanSession>, StoreError> {
        let row = sqlx::query_as::<_, ScanRow>("SELECT * FROM scans WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<ScanSession>, StoreError> {
        let rows = sqlx::query_as::<_, ScanRow>(
            "SELECT * FROM scans ORDER BY created_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut sessions = Vec::with_capacity(rows.len());
        for row in rows {
            sessions.push(self.hydrate(row).await?);
        }
        Ok(sessions)
    }

    async fn list_unfinished(&self) -> Result<Vec<Uuid>, StoreError> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT id FROM scans WHERE status NOT IN (?, ?) ORDER BY created_at",
        )
        .bind(ScanStatus::Complete.as_str())
        .bind(ScanStatus::Failed.as_str())
        .fetch_all(&self.pool)
        .await?;

        ids.iter()
            .map(|id| Uuid::parse_str(id).map_err(|e| StoreError::Corrupt(e.to_string())))
            .collect()
    }

    async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        let key = id.to_string();
        let mut tx = self.pool.begin().await?;
        for table in ["tool_runs", "stage_history"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE scan_id = ?"))
                .bind(&key)
                .execute(&mut *tx)
                .await?;
        }
        let result = sqlx::query("DELETE FROM scans WHERE id = ?")
            .bind(&key)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
pub(crate) async fn memory_pool() -> SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    run_migrations(&pool).await.expect("migrations");
    pool
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        OsFamily, RemediationFinding, RiskAssessment, ScanStage, Severity,
    };

    async fn store() -> SqliteScanStore {
        SqliteScanStore::new(memory_pool().await)
    }

    #[tokio::test]
    async fn upsert_then_get_round_trips_a_fresh_session() {
        let store = store().await;
        let session = ScanSession::new("192.168.1.10");
        store.upsert(&session).await.expect("upsert");

        let loaded = store.get(session.scan_id).await.expect("get").expect("row");
        assert_eq!(loaded.target, "192.168.1.10");
        assert_eq!(loaded.status, ScanStatus::Pending);
        assert_eq!(loaded.stage_history.len(), 1);
        assert_eq!(loaded.stage_history[0].stage, "queued");
        assert!(loaded.completed_at.is_none());
    }

    #[tokio::test]
    async fn partial_update_leaves_other_fields_alone() {
        let store = store().await;
        let session = ScanSession::new("10.0.0.1");
        store.upsert(&session).await.expect("upsert");

        let running = ScanStage::ToolRunning {
            tool: "nmap".into(),
            position: 0,
        };
        store
            .update(session.scan_id, &ScanPatch::stage(&running).with_status(ScanStatus::Scanning))
            .await
            .expect("stage");
        store
            .update(
                session.scan_id,
                &ScanPatch {
                    analysis: Some("looks fine".into()),
                    ..ScanPatch::default()
                },
            )
            .await
            .expect("analysis");
        store
            .update(session.scan_id, &ScanPatch::default().with_tool_run("nmap", "80/tcp open http"))
            .await
            .expect("tool run");
        // second write for the same tool is ignored
        store
            .update(session.scan_id, &ScanPatch::default().with_tool_run("nmap", "overwritten"))
            .await
            .expect("tool run again");

        let loaded = store.get(session.scan_id).await.expect("get").expect("row");
        assert_eq!(loaded.status, ScanStatus::Scanning);
        assert_eq!(loaded.scan_stage, "nmap_running");
        assert_eq!(loaded.analysis.as_deref(), Some("looks fine"));
        assert_eq!(loaded.output_of("nmap"), Some("80/tcp open http"));
        assert_eq!(loaded.tools_used, vec!["nmap"]);
        let stages: Vec<_> = loaded.stage_history.iter().map(|s| s.stage.as_str()).collect();
        assert_eq!(stages, vec!["queued", "nmap_running"]);
    }

    #[tokio::test]
    async fn completion_patch_is_written_in_one_go() {
        let store = store().await;
        let session = ScanSession::new("10.0.0.2");
        store.upsert(&session).await.expect("upsert");

        let report = RemediationReport {
            os_detected: OsFamily::Linux,
            findings: vec![RemediationFinding {
                source: "nmap".into(),
                port: Some("23/tcp".into()),
                finding: None,
                description: "Telnet".into(),
                severity: Severity::Critical,
                commands: vec!["sudo systemctl stop telnet.socket".into()],
            }],
            ai_recommendations: String::new(),
        };
        let done_at = Utc::now();
        let patch = ScanPatch {
            status: Some(ScanStatus::Complete),
            stage: Some(ScanStage::Complete.record()),
            fixes: Some(report.clone()),
            risk: Some(RiskAssessment {
                score: 3.0,
                label: RiskLabel::Low,
            }),
            completed_at: Some(done_at),
            ..ScanPatch::default()
        };
        store.update(session.scan_id, &patch).await.expect("complete");

        let loaded = store.get(session.scan_id).await.expect("get").expect("row");
        assert_eq!(loaded.status, ScanStatus::Complete);
        assert_eq!(loaded.fixes, Some(report));
        assert_eq!(loaded.risk_score, Some(3.0));
        assert_eq!(loaded.risk_label, Some(RiskLabel::Low));
        assert_eq!(loaded.completed_at, Some(done_at));
    }

    #[tokio::test]
    async fn update_of_unknown_scan_is_an_error() {
        let store = store().await;
        let err = store
            .update(Uuid::new_v4(), &ScanPatch::default().with_status(ScanStatus::Failed))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Missing(_)));
    }

    #[tokio::test]
    async fn list_recent_is_newest_first_and_limited() {
        let store = store().await;
        let mut ids = vec![];
        for i in 0..3 {
            let mut s = ScanSession::new(format!("10.0.0.{i}"));
            s.created_at = Utc::now() + chrono::Duration::seconds(i);
            store.upsert(&s).await.expect("upsert");
            ids.push(s.scan_id);
        }
        let recent = store.list_recent(2).await.expect("list");
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].scan_id, ids[2]);
        assert_eq!(recent[1].scan_id, ids[1]);
    }

    #[tokio::test]
    async fn delete_removes_session_and_children() {
        let store = store().await;
        let session = ScanSession::new("10.0.0.3");
        store.upsert(&session).await.expect("upsert");
        store
            .update(session.scan_id, &ScanPatch::default().with_tool_run("nmap", "x"))
            .await
            .expect("run");

        assert!(store.delete(session.scan_id).await.expect("delete"));
        assert!(store.get(session.scan_id).await.expect("get").is_none());
        assert!(!store.delete(session.scan_id).await.expect("second delete"));

        let orphans: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tool_runs")
            .fetch_one(&store.pool)
            .await
            .expect("count");
        assert_eq!(orphans, 0);
    }

    #[tokio::test]
    async fn list_unfinished_skips_terminal_sessions() {
        let store = store().await;
        let running = ScanSession::new("10.0.0.4");
        let done = ScanSession::new("10.0.0.5");
        let failed = ScanSession::new("10.0.0.6");
        for s in [&running, &done, &failed] {
            store.upsert(s).await.expect("upsert");
        }
        store
            .update(running.scan_id, &ScanPatch::default().with_status(ScanStatus::Scanning))
            .await
            .expect("scanning");
        store
            .update(done.scan_id, &ScanPatch::default().with_status(ScanStatus::Complete))
            .await
            .expect("complete");
        store
            .update(failed.scan_id, &ScanPatch::default().with_status(ScanStatus::Failed))
            .await
            .expect("failed");

        assert_eq!(store.list_unfinished().await.expect("list"), vec![running.scan_id]);
    }
}
