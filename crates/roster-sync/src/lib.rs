//! Sync pipeline orchestration: configuration, workbook setup, target
//! selection and the per-record reconciliation loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use roster_core::{ColumnSchema, RunMetrics, SchemaDefinition, Target, TargetStatus};
use roster_scrape::{
    HttpClientConfig, OnlineScraper, ProfileScraper, ProfileSelectorRules, SiteConfig, SiteScraper,
};
use roster_store::{
    open_workbook, RetryExecutor, TabularStore, WorkbookLocator, WorkbookOptions, WritePolicy,
};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod index;
pub mod session;
pub mod tags;
pub mod targets;

pub use index::ExistingIndex;
pub use session::{
    fixed_offset, ReconcileError, ReconciliationSession, SessionOptions, SheetNames, WriteOutcome,
    WriteStatus,
};
pub use tags::TagMapping;
pub use targets::{select_targets, update_target_status};

pub const CRATE_NAME: &str = "roster-sync";

const ONLINE_PATH: &str = "/online_kon/";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub sheet_locator: Option<String>,
    pub access_token: Option<String>,
    pub service_account_email: Option<String>,
    /// 0 means no cap.
    pub max_profiles: usize,
    pub write_delay: Duration,
    pub retry_base_delay: Duration,
    pub max_attempts: usize,
    pub log_sheet: String,
    pub dashboard_sheet: String,
    pub schema_path: Option<PathBuf>,
    pub selectors_path: PathBuf,
    pub site_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub utc_offset_minutes: i32,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Builds the config from any variable source; unset or unparsable values
    /// fall back to defaults.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| var(key).filter(|v| !v.trim().is_empty());
        Self {
            sheet_locator: non_empty("GOOGLE_SHEET_URL"),
            access_token: non_empty("GOOGLE_ACCESS_TOKEN"),
            service_account_email: non_empty("GOOGLE_SERVICE_ACCOUNT_EMAIL"),
            max_profiles: var("MAX_PROFILES_PER_RUN")
                .and_then(|v| v.trim().parse::<i64>().ok())
                .and_then(|v| usize::try_from(v).ok())
                .unwrap_or(0),
            write_delay: var("SHEET_WRITE_DELAY")
                .and_then(|v| v.trim().parse::<f64>().ok())
                .and_then(|v| Duration::try_from_secs_f64(v).ok())
                .unwrap_or(Duration::from_secs(1)),
            retry_base_delay: Duration::from_secs(
                var("SHEET_RETRY_BASE_SECS")
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(5),
            ),
            max_attempts: var("SHEET_MAX_ATTEMPTS")
                .and_then(|v| v.trim().parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(3),
            log_sheet: non_empty("LOG_SHEET_NAME").unwrap_or_else(|| "Log".to_string()),
            dashboard_sheet: non_empty("DASHBOARD_SHEET_NAME")
                .unwrap_or_else(|| "Dashboard".to_string()),
            schema_path: non_empty("ROSTER_SCHEMA_PATH").map(PathBuf::from),
            selectors_path: non_empty("ROSTER_SELECTORS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("rules/profile_selectors.yaml")),
            site_url: non_empty("ROSTER_SITE_URL")
                .unwrap_or_else(|| "https://damadam.pk".to_string()),
            user_agent: non_empty("ROSTER_USER_AGENT")
                .unwrap_or_else(|| "roster-bot/0.1".to_string()),
            http_timeout_secs: var("ROSTER_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(20),
            utc_offset_minutes: var("ROSTER_UTC_OFFSET_MINUTES")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(300),
        }
    }

    pub fn write_policy(&self) -> WritePolicy {
        WritePolicy {
            max_attempts: self.max_attempts,
            base_delay: self.retry_base_delay,
            write_delay: self.write_delay,
        }
    }

    pub fn session_options(&self) -> Result<SessionOptions> {
        Ok(SessionOptions {
            schema: load_schema(self.schema_path.as_deref())?,
            sheets: SheetNames {
                log: self.log_sheet.clone(),
                dashboard: self.dashboard_sheet.clone(),
                ..SheetNames::default()
            },
            policy: self.write_policy(),
            utc_offset: fixed_offset(self.utc_offset_minutes),
        })
    }
}

/// Built-in schema when `path` is `None`, otherwise the YAML definition at
/// `path`, validated.
pub fn load_schema(path: Option<&Path>) -> Result<ColumnSchema> {
    let Some(path) = path else {
        return Ok(ColumnSchema::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading column schema {}", path.display()))?;
    let definition: SchemaDefinition = serde_yaml::from_str(&text)
        .with_context(|| format!("parsing column schema {}", path.display()))?;
    ColumnSchema::try_from(definition)
        .with_context(|| format!("validating column schema {}", path.display()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Pending rows of the Target table, with status write-back.
    Queue,
    /// Whoever the site lists as online right now.
    Online,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetOutcome {
    pub nickname: String,
    pub source: String,
    #[serde(flatten)]
    pub outcome: WriteOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub targets: usize,
    pub metrics: RunMetrics,
    pub outcomes: Vec<TargetOutcome>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    store: Arc<dyn TabularStore>,
    profiles: Arc<dyn ProfileScraper>,
    online: Arc<dyn OnlineScraper>,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn TabularStore>,
        profiles: Arc<dyn ProfileScraper>,
        online: Arc<dyn OnlineScraper>,
    ) -> Self {
        Self {
            config,
            store,
            profiles,
            online,
        }
    }

    /// Opens the configured workbook and builds the site scraper.
    pub async fn connect(config: SyncConfig) -> Result<Self> {
        let raw_locator = config
            .sheet_locator
            .as_deref()
            .context("GOOGLE_SHEET_URL is not set")?;
        let locator = WorkbookLocator::parse(raw_locator)?;
        let store = open_workbook(
            &locator,
            &WorkbookOptions {
                access_token: config.access_token.clone(),
                service_account_email: config.service_account_email.clone(),
                ..WorkbookOptions::default()
            },
        )
        .await?;

        let rules = ProfileSelectorRules::from_path(&config.selectors_path)?;
        let site = Arc::new(SiteScraper::new(
            SiteConfig {
                base_url: config.site_url.clone(),
                online_path: ONLINE_PATH.to_string(),
                http: HttpClientConfig {
                    timeout: Duration::from_secs(config.http_timeout_secs),
                    user_agent: Some(config.user_agent.clone()),
                    ..Default::default()
                },
            },
            rules,
        )?);

        Ok(Self::new(config, store, site.clone(), site))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn open_session(&self) -> Result<ReconciliationSession> {
        let options = self.config.session_options()?;
        let session = ReconciliationSession::setup(self.store.clone(), options)
            .await
            .context("workbook setup failed")?;
        Ok(session)
    }

    /// Eligible queue rows, read without preparing or writing the workbook.
    /// A workbook with no Target table has nothing pending.
    pub async fn pending_targets(&self) -> Result<Vec<Target>> {
        let executor = RetryExecutor::new(self.config.write_policy());
        let store = self.store.as_ref();
        let sheet = SheetNames::default().target;
        let exists = executor
            .execute(&format!("check {sheet}"), || store.sheet_exists(&sheet))
            .await
            .context("checking target queue")?;
        if !exists {
            return Ok(Vec::new());
        }
        let rows = executor
            .execute(&format!("read {sheet}"), || store.get_all_rows(&sheet))
            .await
            .context("reading target queue")?;
        Ok(select_targets(&rows, self.config.max_profiles))
    }

    pub async fn run_once(&self, mode: RunMode) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, ?mode);
        self.run_inner(run_id, mode).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, mode: RunMode) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let mut session = self.open_session().await?;

        let targets = match mode {
            RunMode::Queue => session
                .load_targets(self.config.max_profiles)
                .await
                .context("reading target queue")?,
            RunMode::Online => {
                let mut targets = self
                    .online
                    .fetch_online()
                    .await
                    .context("fetching online list")?;
                if self.config.max_profiles > 0 {
                    targets.truncate(self.config.max_profiles);
                }
                targets
            }
        };
        info!(count = targets.len(), "targets selected");

        let mut outcomes = Vec::with_capacity(targets.len());
        for target in &targets {
            let outcome = match self.profiles.fetch_profile(target).await {
                Ok(record) => match session.write_profile(&record).await {
                    Ok(outcome) => outcome,
                    Err(err) => WriteOutcome::failed(err.to_string()),
                },
                Err(err) => {
                    warn!(nickname = %target.nickname, error = %err, "profile fetch failed");
                    session.record_failure();
                    WriteOutcome::failed(err.to_string())
                }
            };

            let status = if outcome.status == WriteStatus::Error {
                TargetStatus::Error
            } else {
                TargetStatus::Done
            };
            session.mark_target(target, status, &outcome.remarks()).await;

            outcomes.push(TargetOutcome {
                nickname: target.nickname.clone(),
                source: target.source.clone(),
                outcome,
            });
        }

        let metrics = session.finish().await;
        info!(
            processed = metrics.processed,
            success = metrics.success,
            failed = metrics.failed,
            "run finished"
        );

        Ok(SyncRunSummary {
            run_id,
            mode,
            started_at,
            finished_at: Utc::now(),
            targets: targets.len(),
            metrics,
            outcomes,
        })
    }
}

pub async fn run_sync_once_from_env(mode: RunMode, max: Option<usize>) -> Result<SyncRunSummary> {
    let mut config = SyncConfig::from_env();
    if let Some(max) = max {
        config.max_profiles = max;
    }
    let pipeline = SyncPipeline::connect(config).await?;
    pipeline.run_once(mode).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use roster_core::ProfileRecord;
    use roster_scrape::ScrapeError;
    use roster_store::MemoryWorkbook;
    use std::collections::HashMap;
    use std::io::Write;

    struct FakeSite {
        missing: Vec<String>,
        online: Vec<String>,
    }

    #[async_trait]
    impl ProfileScraper for FakeSite {
        async fn fetch_profile(&self, target: &Target) -> Result<ProfileRecord, ScrapeError> {
            if self.missing.contains(&target.nickname) {
                return Err(ScrapeError::HttpStatus {
                    status: 404,
                    url: format!("https://site.example/users/{}/", target.nickname),
                });
            }
            Ok(ProfileRecord::new()
                .with_field("NICK NAME", target.nickname.clone())
                .with_field("CITY", "Lahore")
                .with_field("SOURCE", target.source.clone()))
        }
    }

    #[async_trait]
    impl OnlineScraper for FakeSite {
        async fn fetch_online(&self) -> Result<Vec<Target>, ScrapeError> {
            Ok(self.online.iter().cloned().map(Target::online).collect())
        }
    }

    fn test_config() -> SyncConfig {
        SyncConfig {
            write_delay: Duration::ZERO,
            ..SyncConfig::from_vars(|_| None)
        }
    }

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| c.to_string()).collect()
    }

    fn pipeline(store: Arc<MemoryWorkbook>, config: SyncConfig, site: FakeSite) -> SyncPipeline {
        let site = Arc::new(site);
        SyncPipeline::new(config, store, site.clone(), site)
    }

    #[test]
    fn config_defaults_and_overrides() {
        let defaults = SyncConfig::from_vars(|_| None);
        assert_eq!(defaults.max_profiles, 0);
        assert_eq!(defaults.write_delay, Duration::from_secs(1));
        assert_eq!(defaults.write_policy().max_attempts, 3);
        assert_eq!(defaults.retry_base_delay, Duration::from_secs(5));
        assert_eq!(defaults.log_sheet, "Log");
        assert_eq!(defaults.dashboard_sheet, "Dashboard");
        assert_eq!(defaults.selectors_path, PathBuf::from("rules/profile_selectors.yaml"));
        assert_eq!(defaults.utc_offset_minutes, 300);
        assert!(defaults.sheet_locator.is_none());

        let vars: HashMap<&str, &str> = HashMap::from([
            ("GOOGLE_SHEET_URL", "file:./workbook.json"),
            ("MAX_PROFILES_PER_RUN", "-4"),
            ("SHEET_WRITE_DELAY", "0.25"),
            ("SHEET_MAX_ATTEMPTS", "5"),
            ("LOG_SHEET_NAME", "Audit"),
            ("DASHBOARD_SHEET_NAME", "  "),
        ]);
        let config = SyncConfig::from_vars(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.sheet_locator.as_deref(), Some("file:./workbook.json"));
        assert_eq!(config.max_profiles, 0);
        assert_eq!(config.write_delay, Duration::from_millis(250));
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.log_sheet, "Audit");
        assert_eq!(config.dashboard_sheet, "Dashboard");
    }

    #[test]
    fn schema_file_overrides_builtin_layout() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
columns: [PHOTO, HANDLE, TAGS, CITY, LINK]
identity: HANDLE
links:
  - field: PHOTO
    kind: image
  - field: LINK
    kind: hyperlink
    label: Open
"#
        )
        .unwrap();

        let schema = load_schema(Some(file.path())).unwrap();
        assert_eq!(schema.identity_field(), "HANDLE");
        assert_eq!(schema.len(), 5);
        assert_eq!(schema.link_for("LINK").unwrap().placeholder("https://x"), "Open");
        assert_eq!(load_schema(None).unwrap(), ColumnSchema::default());
    }

    #[test]
    fn schema_file_must_name_its_identity_column() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "columns: [IMAGE, CITY]").unwrap();
        let err = load_schema(Some(file.path())).unwrap_err();
        assert!(format!("{err:#}").contains("NICK NAME"));
    }

    #[tokio::test]
    async fn queue_run_reconciles_and_writes_status_back() {
        let store = Arc::new(MemoryWorkbook::new().with_sheet(
            "Target",
            vec![
                row(&["Nickname", "Status", "Remarks", "Source"]),
                row(&["alice", "Pending", "", "Manual"]),
                row(&["ghost", "pending", "", "Manual"]),
                row(&["bob", "Done", "", "Manual"]),
                row(&["carol", "Pending 🚨"]),
            ],
        ));
        let site = FakeSite {
            missing: vec!["ghost".into()],
            online: Vec::new(),
        };
        let summary = pipeline(store.clone(), test_config(), site)
            .run_once(RunMode::Queue)
            .await
            .unwrap();

        assert_eq!(summary.targets, 3);
        assert_eq!(summary.metrics.processed, 3);
        assert_eq!(summary.metrics.new, 2);
        assert_eq!(summary.metrics.failed, 1);

        let queue = store.rows("Target");
        assert_eq!(queue[1][1..3], ["Done", "New profile"]);
        assert_eq!(queue[2][1], "Error");
        assert!(queue[2][2].contains("404"));
        assert_eq!(queue[3][1], "Done");
        assert_eq!(queue[4][1..3], ["Done", "New profile"]);

        let profiles = store.rows("Profiles");
        assert_eq!(profiles.len(), 3);
        assert_eq!(profiles[2][1], "carol");

        let dashboard = store.rows("Dashboard");
        assert_eq!(dashboard[1][0], "1");
        assert_eq!(dashboard[1][2..], ["3", "2", "1", "2", "0", "0"]);
    }

    #[tokio::test]
    async fn queue_run_respects_the_cap() {
        let store = Arc::new(MemoryWorkbook::new().with_sheet(
            "Target",
            vec![
                row(&["Nickname", "Status", "Remarks", "Source"]),
                row(&["alice", "Pending"]),
                row(&["bob", "Pending"]),
            ],
        ));
        let config = SyncConfig {
            max_profiles: 1,
            ..test_config()
        };
        let site = FakeSite {
            missing: Vec::new(),
            online: Vec::new(),
        };
        let summary = pipeline(store.clone(), config, site)
            .run_once(RunMode::Queue)
            .await
            .unwrap();

        assert_eq!(summary.targets, 1);
        assert_eq!(store.rows("Target")[2][1], "Pending");
    }

    #[tokio::test]
    async fn listing_targets_leaves_the_workbook_untouched() {
        let site = || FakeSite {
            missing: Vec::new(),
            online: Vec::new(),
        };

        let empty = Arc::new(MemoryWorkbook::new());
        let targets = pipeline(empty.clone(), test_config(), site())
            .pending_targets()
            .await
            .unwrap();
        assert!(targets.is_empty());
        assert_eq!(empty.write_count(), 0);
        assert!(!empty.sheet_exists("Profiles").await.unwrap());

        let queued = Arc::new(MemoryWorkbook::new().with_sheet(
            "Target",
            vec![
                row(&["Nickname", "Status", "Remarks", "Source"]),
                row(&["alice", "Done"]),
                row(&["bob", "Pending", "", "Import"]),
            ],
        ));
        let targets = pipeline(queued.clone(), test_config(), site())
            .pending_targets()
            .await
            .unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!((targets[0].nickname.as_str(), targets[0].row), ("bob", Some(3)));
        assert_eq!(queued.write_count(), 0);
    }

    #[tokio::test]
    async fn online_run_skips_target_write_back() {
        let store = Arc::new(MemoryWorkbook::new());
        let site = FakeSite {
            missing: Vec::new(),
            online: vec!["zara".into(), "omar".into()],
        };
        let summary = pipeline(store.clone(), test_config(), site)
            .run_once(RunMode::Online)
            .await
            .unwrap();

        assert_eq!(summary.metrics.new, 2);
        assert_eq!(store.rows("Target").len(), 1);
        let profiles = store.rows("Profiles");
        assert_eq!(profiles[1][16], "Online");
        assert!(summary
            .outcomes
            .iter()
            .all(|o| o.source == "Online" && o.outcome.status == WriteStatus::New));
    }

    #[tokio::test]
    async fn second_run_reports_unchanged_profiles() {
        let store = Arc::new(MemoryWorkbook::new());
        let site = FakeSite {
            missing: Vec::new(),
            online: vec!["zara".into()],
        };
        let pipeline = pipeline(store.clone(), test_config(), site);
        pipeline.run_once(RunMode::Online).await.unwrap();
        let second = pipeline.run_once(RunMode::Online).await.unwrap();

        assert_eq!(second.metrics.unchanged, 1);
        assert_eq!(store.rows("Profiles").len(), 2);
        let dashboard = store.rows("Dashboard");
        assert_eq!(dashboard.len(), 3);
        assert_eq!(dashboard[2][0], "2");
    }

    #[tokio::test]
    async fn local_workbook_locator_opens_a_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workbook.json");
        let config = SyncConfig {
            sheet_locator: Some(format!("file:{}", path.display())),
            selectors_path: Path::new(env!("CARGO_MANIFEST_DIR")).join("../../rules/profile_selectors.yaml"),
            ..test_config()
        };

        let pipeline = SyncPipeline::connect(config).await.unwrap();
        let session = pipeline.open_session().await.unwrap();
        assert!(session.index().is_empty());
        assert!(path.exists());
    }
}
