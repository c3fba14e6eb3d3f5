use std::fmt;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Chat/session identifier that owns a set of jobs. Scopes quotas and
/// listing.
pub type TenantId = i64;

/// Glyph budget for a normalized job name, ellipsis included.
pub const MAX_NAME_GLYPHS: usize = 48;
/// Prompt prefix used to derive a name when none was given.
const NAME_FROM_PROMPT_GLYPHS: usize = 24;

const JOB_ID_HEX_LEN: usize = 10;
const JOB_ID_RETRIES: usize = 8;
const JOB_ID_FALLBACK_HEX_LEN: usize = 32;

/// Defines when a job fires.
///
/// Serialized with a `kind` discriminator (`"at"`, `"every"`, `"cron"`)
/// so the stored form is self-describing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Schedule {
    /// Fire once at an absolute epoch-ms instant.
    #[serde(rename_all = "camelCase")]
    At { at_ms: i64 },

    /// Fire at `anchor_ms + k * every_ms` for whole `k`. An omitted
    /// anchor (0) is resolved to the creation instant.
    #[serde(rename_all = "camelCase")]
    Every {
        every_ms: i64,
        #[serde(default)]
        anchor_ms: i64,
    },

    /// Fire per cron expression, read as wall-clock time in `timezone`.
    /// An omitted timezone is resolved to the service default.
    #[serde(rename_all = "camelCase")]
    Cron {
        expr: String,
        #[serde(default)]
        timezone: String,
    },
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::At { at_ms } => write!(f, "once at {at_ms}ms"),
            Self::Every { every_ms, .. } => {
                if *every_ms >= 3_600_000 {
                    write!(f, "every {}h", every_ms / 3_600_000)
                } else if *every_ms >= 60_000 {
                    write!(f, "every {}m", every_ms / 60_000)
                } else {
                    write!(f, "every {}s", every_ms / 1000)
                }
            }
            Self::Cron { expr, timezone } => write!(f, "cron '{expr}' ({timezone})"),
        }
    }
}

/// Per-job execution policy. Values outside their valid range are
/// clamped back to the service defaults at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunPolicy {
    /// How stale a one-shot may be at startup and still fire.
    pub max_lateness_ms: i64,
    /// Retry attempts after a failed one-shot run.
    pub retry_max: u32,
    /// Base backoff; attempt `k` waits `backoff * 2^(k-1)`.
    pub retry_backoff_ms: i64,
    /// Delete the job after a successful one-shot run.
    pub delete_after_run: bool,
}

impl RunPolicy {
    /// Resolve caller overrides against the service defaults, clamping
    /// out-of-range values back to the default.
    pub fn clamped(overrides: &PolicyOverrides, defaults: &RunPolicy) -> Self {
        Self {
            max_lateness_ms: overrides
                .max_lateness_ms
                .filter(|v| *v >= 0)
                .unwrap_or(defaults.max_lateness_ms),
            retry_max: overrides.retry_max.unwrap_or(defaults.retry_max),
            retry_backoff_ms: overrides
                .retry_backoff_ms
                .filter(|v| *v >= 1000)
                .unwrap_or(defaults.retry_backoff_ms),
            delete_after_run: overrides
                .delete_after_run
                .unwrap_or(defaults.delete_after_run),
        }
    }
}

/// Partial policy supplied at creation time.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyOverrides {
    pub max_lateness_ms: Option<i64>,
    pub retry_max: Option<u32>,
    pub retry_backoff_ms: Option<i64>,
    pub delete_after_run: Option<bool>,
}

/// Outcome classification of the most recent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Ok,
    Error,
    Missed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Ok => "ok",
            RunStatus::Error => "error",
            RunStatus::Missed => "missed",
        };
        write!(f, "{s}")
    }
}

/// Mutable runtime block of a job. Mutated only under the serializer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobState {
    /// Epoch-ms of the next planned fire; 0 when not scheduled.
    pub next_run_at_ms: i64,
    /// Present iff a dispatch is in flight for this job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running_run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status: Option<RunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Opaque short id (10 hex chars nominal).
    pub id: String,
    /// Owning chat/session.
    pub tenant: TenantId,
    /// Store namespace; fixed at creation.
    pub bot_name: String,
    /// Human label, normalized.
    pub name: String,
    /// Payload handed verbatim to the executor.
    pub prompt: String,
    pub enabled: bool,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
    pub schedule: Schedule,
    pub policy: RunPolicy,
    #[serde(default)]
    pub state: JobState,
}

impl Job {
    /// Bump `updated_at_ms`, keeping it non-decreasing.
    pub fn touch(&mut self, now_ms: i64) {
        self.updated_at_ms = self.updated_at_ms.max(now_ms);
    }
}

/// What caused a run to be enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunSource {
    Timer,
    Cron,
    Manual,
    StartupCatchup,
    Retry,
}

impl fmt::Display for RunSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunSource::Timer => "timer",
            RunSource::Cron => "cron",
            RunSource::Manual => "manual",
            RunSource::StartupCatchup => "startup-catchup",
            RunSource::Retry => "retry",
        };
        write!(f, "{s}")
    }
}

/// A queued trigger awaiting dispatch.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub job_id: String,
    pub source: RunSource,
    pub scheduled_at_ms: i64,
    /// Bypass the `enabled` gate (manual runs). Never bypasses the
    /// one-run-per-job invariant.
    pub force: bool,
}

/// Service snapshot over a tenant's (or all) jobs.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub enabled: bool,
    pub total_jobs: usize,
    pub enabled_jobs: usize,
    pub running_jobs: usize,
    pub queued_jobs: usize,
    /// Earliest planned fire among enabled jobs; 0 when nothing is due.
    pub next_run_at_ms: i64,
}

/// Input to `create`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJob {
    pub tenant: TenantId,
    #[serde(default)]
    pub name: Option<String>,
    pub prompt: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub schedule: Schedule,
    #[serde(default)]
    pub policy: PolicyOverrides,
}

fn default_true() -> bool {
    true
}

/// Read-only context handed to the executor for one run.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Deep copy of the job at dispatch time.
    pub job: Job,
    pub run_id: String,
    pub source: RunSource,
    pub scheduled_at_ms: i64,
}

/// Executor reply for one run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub ok: bool,
    pub error: Option<String>,
}

impl RunOutcome {
    pub fn ok() -> Self {
        Self { ok: true, error: None }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
        }
    }
}

/// The injected execution capability. The scheduler knows nothing about
/// what a run does beyond this reply.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, ctx: RunContext) -> RunOutcome;
}

/// Collapse whitespace/control runs to single spaces, trim, and cap at
/// [`MAX_NAME_GLYPHS`] with an ellipsis.
pub fn normalize_name(raw: &str) -> String {
    let mut out = String::new();
    let mut pending_space = false;
    for c in raw.chars() {
        if c.is_whitespace() || c.is_control() {
            pending_space = !out.is_empty();
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.push(c);
    }
    if out.chars().count() > MAX_NAME_GLYPHS {
        let mut truncated: String = out.chars().take(MAX_NAME_GLYPHS - 1).collect();
        truncated.push('…');
        return truncated;
    }
    out
}

/// Resolve the display name for a new job: explicit name, then a prompt
/// prefix, then `job-<id>`.
pub(crate) fn resolve_name(raw: Option<&str>, prompt: &str, id: &str) -> String {
    let name = normalize_name(raw.unwrap_or(""));
    if !name.is_empty() {
        return name;
    }
    let prefix: String = prompt.chars().take(NAME_FROM_PROMPT_GLYPHS).collect();
    let derived = normalize_name(&prefix);
    if !derived.is_empty() {
        return derived;
    }
    format!("job-{id}")
}

pub(crate) fn random_hex_id(len: usize) -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| HEX[rng.gen_range(0..HEX.len())] as char)
        .collect()
}

/// Generate a short job id, retrying on collision and falling back to a
/// long id when the short space is exhausted.
pub(crate) fn generate_job_id(taken: impl Fn(&str) -> bool) -> String {
    for _ in 0..=JOB_ID_RETRIES {
        let id = random_hex_id(JOB_ID_HEX_LEN);
        if !taken(&id) {
            return id;
        }
    }
    random_hex_id(JOB_ID_FALLBACK_HEX_LEN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_whitespace_and_control() {
        assert_eq!(normalize_name("  hello\t\nworld  "), "hello world");
        assert_eq!(normalize_name("a\u{0007}b"), "a b");
        assert_eq!(normalize_name("\n\n\n"), "");
    }

    #[test]
    fn normalize_truncates_to_glyph_budget() {
        let long = "x".repeat(100);
        let name = normalize_name(&long);
        assert_eq!(name.chars().count(), MAX_NAME_GLYPHS);
        assert!(name.ends_with('…'));
    }

    #[test]
    fn name_at_budget_is_untouched() {
        let exact = "y".repeat(MAX_NAME_GLYPHS);
        assert_eq!(normalize_name(&exact), exact);
    }

    #[test]
    fn resolve_name_prefers_explicit_then_prompt_then_id() {
        assert_eq!(resolve_name(Some("Daily digest"), "p", "abc"), "Daily digest");
        assert_eq!(
            resolve_name(None, "summarize the overnight alerts please", "abc"),
            "summarize the overnight"
        );
        assert_eq!(resolve_name(Some("  "), "\t\n", "abc"), "job-abc");
    }

    #[test]
    fn policy_clamps_out_of_range_values() {
        let defaults = RunPolicy {
            max_lateness_ms: 1000,
            retry_max: 3,
            retry_backoff_ms: 5000,
            delete_after_run: false,
        };
        let overrides = PolicyOverrides {
            max_lateness_ms: Some(-5),
            retry_max: Some(0),
            retry_backoff_ms: Some(999),
            delete_after_run: Some(true),
        };
        let policy = RunPolicy::clamped(&overrides, &defaults);
        assert_eq!(policy.max_lateness_ms, 1000);
        assert_eq!(policy.retry_max, 0);
        assert_eq!(policy.retry_backoff_ms, 5000);
        assert!(policy.delete_after_run);
    }

    #[test]
    fn policy_accepts_boundary_backoff() {
        let defaults = RunPolicy {
            max_lateness_ms: 1000,
            retry_max: 3,
            retry_backoff_ms: 5000,
            delete_after_run: false,
        };
        let overrides = PolicyOverrides {
            retry_backoff_ms: Some(1000),
            ..Default::default()
        };
        assert_eq!(RunPolicy::clamped(&overrides, &defaults).retry_backoff_ms, 1000);
    }

    #[test]
    fn schedule_wire_format_uses_kind_discriminator() {
        let at = Schedule::At { at_ms: 42 };
        let json = serde_json::to_string(&at).unwrap();
        assert_eq!(json, r#"{"kind":"at","atMs":42}"#);

        let every = Schedule::Every { every_ms: 60_000, anchor_ms: 7 };
        let json = serde_json::to_string(&every).unwrap();
        assert_eq!(json, r#"{"kind":"every","everyMs":60000,"anchorMs":7}"#);

        let cron = Schedule::Cron {
            expr: "0 9 * * *".into(),
            timezone: "Europe/Riga".into(),
        };
        let json = serde_json::to_string(&cron).unwrap();
        assert!(json.contains(r#""kind":"cron""#));
        assert!(json.contains(r#""timezone":"Europe/Riga""#));
    }

    #[test]
    fn every_anchor_defaults_on_decode() {
        let every: Schedule = serde_json::from_str(r#"{"kind":"every","everyMs":1000}"#).unwrap();
        assert_eq!(every, Schedule::Every { every_ms: 1000, anchor_ms: 0 });
    }

    #[test]
    fn job_wire_format_is_camel_case() {
        let job = Job {
            id: "abc123".into(),
            tenant: 99,
            bot_name: "marvin".into(),
            name: "n".into(),
            prompt: "p".into(),
            enabled: true,
            created_at_ms: 1,
            updated_at_ms: 2,
            schedule: Schedule::At { at_ms: 3 },
            policy: RunPolicy {
                max_lateness_ms: 0,
                retry_max: 0,
                retry_backoff_ms: 1000,
                delete_after_run: true,
            },
            state: JobState::default(),
        };
        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains(r#""botName":"marvin""#));
        assert!(json.contains(r#""createdAtMs":1"#));
        assert!(json.contains(r#""deleteAfterRun":true"#));
        assert!(json.contains(r#""nextRunAtMs":0"#));
        // Absent optionals are skipped entirely.
        assert!(!json.contains("runningRunId"));

        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn run_source_wire_names() {
        let json = serde_json::to_string(&RunSource::StartupCatchup).unwrap();
        assert_eq!(json, r#""startup-catchup""#);
        assert_eq!(RunSource::StartupCatchup.to_string(), "startup-catchup");
    }

    #[test]
    fn touch_is_monotonic() {
        let mut job = Job {
            id: "a".into(),
            tenant: 1,
            bot_name: "b".into(),
            name: "n".into(),
            prompt: "p".into(),
            enabled: true,
            created_at_ms: 100,
            updated_at_ms: 100,
            schedule: Schedule::At { at_ms: 1 },
            policy: RunPolicy {
                max_lateness_ms: 0,
                retry_max: 0,
                retry_backoff_ms: 1000,
                delete_after_run: false,
            },
            state: JobState::default(),
        };
        job.touch(50);
        assert_eq!(job.updated_at_ms, 100);
        job.touch(200);
        assert_eq!(job.updated_at_ms, 200);
    }

    #[test]
    fn generated_ids_are_short_hex_with_fallback() {
        let id = generate_job_id(|_| false);
        assert_eq!(id.len(), 10);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));

        // Every short candidate "collides" — the generator falls back to
        // the long form.
        let long = generate_job_id(|candidate| candidate.len() == 10);
        assert_eq!(long.len(), 32);
    }

    #[test]
    fn schedule_display_is_compact() {
        assert_eq!(Schedule::Every { every_ms: 90_000, anchor_ms: 0 }.to_string(), "every 1m");
        assert_eq!(Schedule::Every { every_ms: 7_200_000, anchor_ms: 0 }.to_string(), "every 2h");
        assert_eq!(
            Schedule::Cron { expr: "0 9 * * *".into(), timezone: "UTC".into() }.to_string(),
            "cron '0 9 * * *' (UTC)"
        );
    }
}
