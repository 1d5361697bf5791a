//! Feedback Store
//!
//! Append-only log of like/dislike verdicts on shown recommendation batches.
//! The engine only needs the latest verdict per `(user, action)` to build
//! its exclusion set; the full log feeds the A/B summary.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::recommendation::ab::AbGroup;

/// Strategies whose batches can be rated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackAction {
    Popular,
    Personalized,
    Nearest,
    Weather,
    Occasions,
    Random,
}

impl FeedbackAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackAction::Popular => "popular",
            FeedbackAction::Personalized => "personalized",
            FeedbackAction::Nearest => "nearest",
            FeedbackAction::Weather => "weather",
            FeedbackAction::Occasions => "occasions",
            FeedbackAction::Random => "random",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "popular" => Some(FeedbackAction::Popular),
            "personalized" => Some(FeedbackAction::Personalized),
            "nearest" => Some(FeedbackAction::Nearest),
            "weather" => Some(FeedbackAction::Weather),
            "occasions" | "occasion" => Some(FeedbackAction::Occasions),
            "random" => Some(FeedbackAction::Random),
            _ => None,
        }
    }
}

impl std::fmt::Display for FeedbackAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One verdict on one shown batch. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackEvent {
    pub id: Uuid,
    pub user_id: String,
    pub action: FeedbackAction,
    pub liked: bool,
    /// De-duplicated, first-seen order
    pub shown_media_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ab_group: Option<AbGroup>,
    pub created_at: DateTime<Utc>,
}

impl FeedbackEvent {
    /// Build a validated event stamped with a fresh id and the current time
    pub fn new(
        user_id: &str,
        action: FeedbackAction,
        liked: bool,
        shown_media_ids: Vec<String>,
        ab_group: Option<AbGroup>,
    ) -> Result<Self> {
        let user_id = user_id.trim();
        if user_id.is_empty() {
            return Err(Error::bad_request("userId is required"));
        }

        let mut seen = HashSet::new();
        let shown_media_ids = shown_media_ids
            .into_iter()
            .filter(|id| !id.is_empty() && seen.insert(id.clone()))
            .collect();

        Ok(Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            action,
            liked,
            shown_media_ids,
            ab_group,
            created_at: Utc::now(),
        })
    }
}

/// Storage seam for feedback
pub trait FeedbackStore: Send + Sync {
    fn append(&self, event: FeedbackEvent) -> Result<()>;

    /// Most recent event for `(user, action)`
    fn latest(&self, user_id: &str, action: FeedbackAction) -> Result<Option<FeedbackEvent>>;

    /// All events created at or after `cutoff`
    fn events_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<FeedbackEvent>>;
}

/// Media ids to suppress for the next `(user, action)` batch.
///
/// Only the latest verdict counts: a dislike suppresses exactly the batch it
/// was about, a like (or no verdict) suppresses nothing.
pub fn exclusion_for(
    store: &dyn FeedbackStore,
    user_id: &str,
    action: FeedbackAction,
) -> Result<HashSet<String>> {
    let excluded = match store.latest(user_id, action)? {
        Some(event) if !event.liked => event.shown_media_ids.into_iter().collect(),
        _ => HashSet::new(),
    };
    if !excluded.is_empty() {
        debug!(
            "Excluding {} media for user={} action={}",
            excluded.len(),
            user_id,
            action
        );
    }
    Ok(excluded)
}

/// Events plus the journal they are mirrored to, guarded together so the
/// file order always matches the in-memory order
#[derive(Default)]
struct FeedbackLog {
    events: Vec<FeedbackEvent>,
    latest: HashMap<(String, FeedbackAction), usize>,
    journal: Option<File>,
}

impl FeedbackLog {
    fn push(&mut self, event: FeedbackEvent) {
        let key = (event.user_id.clone(), event.action);
        let index = self.events.len();
        let newer = match self.latest.get(&key) {
            Some(&current) => event.created_at >= self.events[current].created_at,
            None => true,
        };
        self.events.push(event);
        if newer {
            self.latest.insert(key, index);
        }
    }
}

/// In-memory store, optionally journaled to a JSON-lines file
#[derive(Default)]
pub struct InMemoryFeedbackStore {
    log: RwLock<FeedbackLog>,
}

impl InMemoryFeedbackStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replay `path` (one JSON event per line) if it exists, then append
    /// every new event to it. Unreadable lines are skipped with a warning.
    pub fn with_journal(path: impl AsRef<Path>) -> Result<Self> {
        let path: PathBuf = path.as_ref().to_path_buf();
        let mut log = FeedbackLog::default();

        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (line_no, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<FeedbackEvent>(&line) {
                    Ok(event) => log.push(event),
                    Err(e) => warn!(
                        "Skipping feedback line {} in {}: {}",
                        line_no + 1,
                        path.display(),
                        e
                    ),
                }
            }
        }

        info!(
            "📒 Feedback journal {} loaded ({} events)",
            path.display(),
            log.events.len()
        );

        log.journal = Some(OpenOptions::new().create(true).append(true).open(&path)?);
        Ok(Self {
            log: RwLock::new(log),
        })
    }

    pub fn len(&self) -> usize {
        self.read_log().map(|log| log.events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_log(&self) -> Result<std::sync::RwLockReadGuard<'_, FeedbackLog>> {
        self.log
            .read()
            .map_err(|_| poisoned("feedback log"))
    }
}

impl FeedbackStore for InMemoryFeedbackStore {
    fn append(&self, event: FeedbackEvent) -> Result<()> {
        let mut log = self
            .log
            .write()
            .map_err(|_| poisoned("feedback log"))?;

        if let Some(file) = log.journal.as_mut() {
            let mut line = serde_json::to_vec(&event)?;
            line.push(b'\n');
            file.write_all(&line)?;
        }
        log.push(event);
        Ok(())
    }

    fn latest(&self, user_id: &str, action: FeedbackAction) -> Result<Option<FeedbackEvent>> {
        let log = self.read_log()?;
        Ok(log
            .latest
            .get(&(user_id.to_string(), action))
            .map(|&index| log.events[index].clone()))
    }

    fn events_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<FeedbackEvent>> {
        let log = self.read_log()?;
        Ok(log
            .events
            .iter()
            .filter(|event| event.created_at >= cutoff)
            .cloned()
            .collect())
    }
}

fn poisoned(what: &str) -> Error {
    Error::Internal {
        source: Some(format!("{what} lock poisoned").into()),
    }
}

/// Like/dislike counts for one slice of the log
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackTally {
    pub likes: u64,
    pub dislikes: u64,
    pub total: u64,
    pub like_rate: f64,
}

impl FeedbackTally {
    fn add(&mut self, liked: bool) {
        if liked {
            self.likes += 1;
        } else {
            self.dislikes += 1;
        }
        self.total += 1;
        self.like_rate = self.likes as f64 / self.total as f64;
    }
}

/// A/B experiment readout over a trailing window
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AbSummary {
    pub days: i64,
    pub since: DateTime<Utc>,
    pub total_events: u64,
    /// Keyed by "A", "B" or "unassigned"
    pub groups: BTreeMap<String, FeedbackTally>,
    pub actions: BTreeMap<String, FeedbackTally>,
    /// Keyed by "<group>:<action>"
    pub group_actions: BTreeMap<String, FeedbackTally>,
}

pub const DEFAULT_SUMMARY_DAYS: i64 = 30;

/// Summarize feedback of the last `days` days (clamped to 1..=365)
pub fn ab_summary(store: &dyn FeedbackStore, days: i64, now: DateTime<Utc>) -> Result<AbSummary> {
    let days = days.clamp(1, 365);
    let since = now - Duration::days(days);

    let mut summary = AbSummary {
        days,
        since,
        total_events: 0,
        groups: BTreeMap::new(),
        actions: BTreeMap::new(),
        group_actions: BTreeMap::new(),
    };

    for event in store.events_since(since)? {
        let group = event.ab_group.map_or("unassigned", |g| g.as_str());
        summary.total_events += 1;
        summary
            .groups
            .entry(group.to_string())
            .or_default()
            .add(event.liked);
        summary
            .actions
            .entry(event.action.to_string())
            .or_default()
            .add(event.liked);
        summary
            .group_actions
            .entry(format!("{}:{}", group, event.action))
            .or_default()
            .add(event.liked);
    }

    Ok(summary)
}
