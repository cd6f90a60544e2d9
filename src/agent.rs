//! # AgentLoop
//!
//! The long-running `rekkord agent` process (§4.11): polls a plan server for
//! a list of channels to back up on a schedule, runs each due save through
//! the normal `SaveEngine`, and reports success or failure back to the plan
//! server. A second thread serves a local control socket so a tray-style
//! client can ask for a refreshed view of the plan without waiting for the
//! next tick. Generalizes the teacher's `RunAgent`/`FetchPlan`/`ShouldRun`
//! split (`cli/agent.cc`) from its single global-mutex-guarded plan array to
//! an `Arc<Mutex<Vec<PlanItem>>>` shared between the two threads.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{Datelike, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::config::LinkSettings;
use crate::error::{Error, Result};
use crate::oid::Oid;
use crate::repo::Repository;
use crate::save::{PreviousTree, SaveEngine, SaveSettings};

/// One scheduled backup as returned by `/api/plan/fetch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanItem {
    pub channel: String,
    /// Time of day the save should trigger, encoded as `hour * 100 + minute`.
    pub clock: i32,
    /// Weekday bitmask, bit 0 = Monday .. bit 6 = Sunday.
    pub days: u8,
    pub paths: Vec<PathBuf>,
    /// Unix epoch ms of the last attempt, or 0 if never run.
    pub timestamp: i64,
    pub success: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct PlanItemWire {
    #[allow(dead_code)]
    #[serde(default)]
    id: Option<serde_json::Value>,
    channel: String,
    clock: i32,
    days: i32,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    success: bool,
    #[serde(default)]
    paths: Vec<String>,
}

impl From<PlanItemWire> for PlanItem {
    fn from(wire: PlanItemWire) -> Self {
        PlanItem {
            channel: wire.channel,
            clock: wire.clock,
            days: (wire.days & 0b0111_1111) as u8,
            paths: wire.paths.into_iter().map(PathBuf::from).collect(),
            timestamp: wire.timestamp.unwrap_or(0),
            success: wire.success,
        }
    }
}

/// Fetches the current plan from `link.url`, authenticated with
/// `X-Api-Key: link.api_key` (§4.11, grounded on `FetchPlan`/`SendReport` in
/// `cli/agent.cc` and `cli/link.cc`).
fn fetch_plan(link: &LinkSettings) -> Result<Vec<PlanItem>> {
    let url = format!("{}/api/plan/fetch", link.url.trim_end_matches('/'));
    let response = ureq::get(&url)
        .set("X-Api-Key", &link.api_key)
        .call()
        .map_err(|e| Error::Other(anyhow::anyhow!("fetching backup plan: {e}")))?;
    let wire: Vec<PlanItemWire> = response
        .into_json()
        .map_err(|e| Error::Other(anyhow::anyhow!("parsing backup plan: {e}")))?;
    Ok(wire.into_iter().map(PlanItem::from).collect())
}

fn send_report(link: &LinkSettings, body: &serde_json::Value) -> Result<()> {
    let url = format!("{}/api/link/snapshot", link.url.trim_end_matches('/'));
    ureq::post(&url)
        .set("X-Api-Key", &link.api_key)
        .send_json(body.clone())
        .map_err(|e| Error::Other(anyhow::anyhow!("sending report: {e}")))?;
    Ok(())
}

fn report_snapshot(
    link: &LinkSettings,
    repository: &str,
    channel: &str,
    time_ms: i64,
    oid: Oid,
    size: u64,
    stored: u64,
    added: u64,
) -> Result<()> {
    send_report(
        link,
        &serde_json::json!({
            "repository": repository,
            "channel": channel,
            "timestamp": time_ms,
            "oid": oid.to_string(),
            "size": size,
            "stored": stored,
            "added": added,
        }),
    )
}

fn report_error(link: &LinkSettings, repository: &str, channel: &str, time_ms: i64, message: &str) -> Result<()> {
    send_report(
        link,
        &serde_json::json!({
            "repository": repository,
            "channel": channel,
            "timestamp": time_ms,
            "error": message,
        }),
    )
}

fn weekday_bit(date: NaiveDate) -> u8 {
    1 << date.weekday().num_days_from_monday()
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Decides whether `item` is due to run at `now_ms` (§4.11, ported verbatim
/// from `ShouldRun` in `cli/agent.cc`): a week of silence or a prior failure
/// always forces a run; otherwise the item runs once for every scheduled
/// weekday its last attempt skipped over, plus its own day once the clock
/// has crossed `item.clock`.
fn should_run(item: &PlanItem, now_ms: i64) -> bool {
    const WEEK_MS: i64 = 7 * 86_400_000;

    if now_ms - item.timestamp >= WEEK_MS {
        return true;
    }
    if !item.success {
        return true;
    }

    let then = match Utc.timestamp_millis_opt(item.timestamp).single() {
        Some(t) => t,
        None => return true,
    };
    let now = match Utc.timestamp_millis_opt(now_ms).single() {
        Some(t) => t,
        None => return false,
    };

    let then_date = then.date_naive();
    let today = now.date_naive();

    if then_date < today {
        let mut date = then_date.succ_opt().unwrap_or(today);
        while date < today {
            if item.days & weekday_bit(date) != 0 {
                return true;
            }
            date = match date.succ_opt() {
                Some(d) => d,
                None => break,
            };
        }
    }

    if item.days & weekday_bit(today) != 0 {
        let hhmm_then = then.hour() as i32 * 100 + then.minute() as i32;
        let hhmm_now = now.hour() as i32 * 100 + now.minute() as i32;
        if hhmm_then < item.clock && hhmm_now >= item.clock {
            return true;
        }
    }

    false
}

/// The address the client reaches the agent at (§4.11 / §6): a Unix domain
/// socket on the local filesystem. Windows named-pipe support is a known
/// gap, carried in `DESIGN.md`.
pub fn default_socket_path() -> PathBuf {
    if let Some(runtime) = dirs::runtime_dir() {
        runtime.join("rekkord-agent.sock")
    } else {
        std::env::temp_dir().join("rekkord-agent.sock")
    }
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// How long to sleep between plan-execution ticks.
    pub period: Duration,
    pub socket_path: PathBuf,
    /// Display name reported back to the plan server (§4.11 `repository`
    /// field); normally the repository's configured URL.
    pub repository_label: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        AgentSettings {
            period: Duration::from_secs(3600),
            socket_path: default_socket_path(),
            repository_label: String::new(),
        }
    }
}

pub struct AgentLoop<'a> {
    repo: &'a Repository,
    link: LinkSettings,
    settings: AgentSettings,
    items: Arc<Mutex<Vec<PlanItem>>>,
}

impl<'a> AgentLoop<'a> {
    pub fn new(repo: &'a Repository, link: LinkSettings, settings: AgentSettings) -> Self {
        AgentLoop {
            repo,
            link,
            settings,
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Fetches the plan and replaces the shared item list. `true` on the
    /// initial call is fatal if it fails (§4.11: the agent refuses to start
    /// against an unreachable plan server).
    fn update_plan(&self) -> Result<()> {
        let fresh = fetch_plan(&self.link)?;
        let mut guard = self.items.lock().unwrap();
        *guard = fresh;
        Ok(())
    }

    /// Runs every due item once, reporting each outcome. Returns the number
    /// of items that ran.
    fn run_plan(&self) -> usize {
        let mut guard = self.items.lock().unwrap();
        let now = now_ms();
        let mut ran = 0;

        for item in guard.iter_mut() {
            if !should_run(item, now) {
                continue;
            }
            ran += 1;
            log::info!("running scheduled snapshot for '{}'", item.channel);

            crate::logging::push_log_filter();
            let result = self.run_snapshot(&item.channel, &item.paths);
            let captured = crate::logging::pop_log_filter().unwrap_or_default();

            match result {
                Ok((oid, time_ms, size, stored, added)) => {
                    if let Err(e) = report_snapshot(
                        &self.link,
                        &self.settings.repository_label,
                        &item.channel,
                        time_ms,
                        oid,
                        size,
                        stored,
                        added,
                    ) {
                        log::warn!("failed to report snapshot for '{}': {e}", item.channel);
                    }
                    item.timestamp = time_ms;
                    item.success = true;
                }
                Err(e) => {
                    let now = now_ms();
                    let message = if captured.trim().is_empty() {
                        e.to_string()
                    } else {
                        captured.trim().to_string()
                    };
                    if let Err(report_err) =
                        report_error(&self.link, &self.settings.repository_label, &item.channel, now, &message)
                    {
                        log::warn!("failed to report error for '{}': {report_err}", item.channel);
                    }
                    item.timestamp = now;
                    item.success = false;
                }
            }
        }

        ran
    }

    fn run_snapshot(&self, channel: &str, paths: &[PathBuf]) -> Result<(Oid, i64, u64, u64, u64)> {
        let engine = SaveEngine::new(&self.repo.blobs, self.repo.chunker);
        let previous: Option<PreviousTree> = self
            .repo
            .current_snapshot(channel)?
            .map(|entry| engine.flatten_previous(entry.oid))
            .transpose()?;

        let outcome = engine.save(channel, paths, &SaveSettings::default(), previous.as_ref())?;
        if let Some(error) = outcome.errors.first() {
            return Err(Error::Other(anyhow::anyhow!(
                "{}: {}",
                error.path.display(),
                error.message
            )));
        }

        let Some(snapshot_oid) = outcome.snapshot else {
            return Err(Error::Other(anyhow::anyhow!("save produced no snapshot")));
        };
        self.repo
            .append_channel_entry(channel, now_ms(), snapshot_oid)?;

        Ok((
            snapshot_oid,
            now_ms(),
            outcome.stats.source_size,
            outcome.stats.stored_size,
            outcome.stats.added_size,
        ))
    }

    /// Serializes the current plan as the control-socket reply payload
    /// (§4.11, mirrors `SendInfo` in `cli/agent.cc`).
    fn snapshot_items(&self) -> serde_json::Value {
        let guard = self.items.lock().unwrap();
        let items: Vec<_> = guard
            .iter()
            .map(|item| {
                serde_json::json!({
                    "channel": item.channel,
                    "clock": item.clock,
                    "days": item.days,
                    "timestamp": item.timestamp,
                    "success": item.success,
                })
            })
            .collect();
        serde_json::json!({ "items": items })
    }

    /// Runs the agent until interrupted: an initial plan fetch (fatal if it
    /// fails), a background control-socket server, and the schedule loop on
    /// the calling thread.
    pub fn run(&self) -> Result<()> {
        self.update_plan()?;

        std::thread::scope(|scope| {
            scope.spawn(|| self.serve_control_socket());

            loop {
                self.run_plan();

                std::thread::sleep(self.settings.period);

                if let Err(e) = self.update_plan() {
                    log::warn!("failed to refresh backup plan: {e}");
                }
            }
        });
    }

    #[cfg(unix)]
    fn serve_control_socket(&self) {
        use std::os::unix::net::UnixListener;

        let _ = std::fs::remove_file(&self.settings.socket_path);
        let listener = match UnixListener::bind(&self.settings.socket_path) {
            Ok(listener) => listener,
            Err(e) => {
                log::error!(
                    "failed to bind control socket {}: {e}",
                    self.settings.socket_path.display()
                );
                return;
            }
        };

        for stream in listener.incoming() {
            let Ok(stream) = stream else { continue };
            if let Err(e) = self.handle_client(stream) {
                log::warn!("control socket client error: {e}");
            }
        }
    }

    #[cfg(unix)]
    fn handle_client(&self, stream: std::os::unix::net::UnixStream) -> Result<()> {
        let mut reader = BufReader::new(stream.try_clone()?);
        let mut writer = stream;

        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }

        #[derive(Deserialize)]
        struct Request {
            #[serde(default)]
            refresh: bool,
        }

        let request: Request = serde_json::from_str(line.trim())
            .map_err(|e| Error::Other(anyhow::anyhow!("malformed control request: {e}")))?;

        if request.refresh {
            let reply = self.snapshot_items();
            let mut payload = serde_json::to_vec(&reply)
                .map_err(|e| Error::Other(anyhow::anyhow!("encoding control reply: {e}")))?;
            payload.push(b'\n');
            writer.write_all(&payload)?;
        }

        Ok(())
    }

    #[cfg(not(unix))]
    fn serve_control_socket(&self) {
        log::warn!("agent control socket is only supported on unix targets");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(days: u8, clock: i32, timestamp: i64, success: bool) -> PlanItem {
        PlanItem {
            channel: "daily".into(),
            clock,
            days,
            paths: Vec::new(),
            timestamp,
            success,
        }
    }

    #[test]
    fn runs_when_never_attempted() {
        assert!(should_run(&item(0b0111_1111, 0, 0, false), now_ms()));
    }

    #[test]
    fn runs_after_a_week_of_silence() {
        let now = now_ms();
        let it = item(0, 1200, now - 8 * 86_400_000, true);
        assert!(should_run(&it, now));
    }

    #[test]
    fn runs_after_a_prior_failure_regardless_of_schedule() {
        let now = now_ms();
        let it = item(0, 1200, now - 1000, false);
        assert!(should_run(&it, now));
    }

    #[test]
    fn does_not_run_outside_the_scheduled_window() {
        let then = Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 5, 10, 0, 0).unwrap();
        let monday_bit = 1 << then.weekday().num_days_from_monday();

        let it = item(monday_bit, 2300, then.timestamp_millis(), true);
        assert!(!should_run(&it, now.timestamp_millis()));
    }

    #[test]
    fn runs_once_the_clock_crosses_the_scheduled_time() {
        let then = Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 1, 5, 10, 30, 0).unwrap();
        let monday_bit = 1 << then.weekday().num_days_from_monday();

        let it = item(monday_bit, 1000, then.timestamp_millis(), true);
        assert!(should_run(&it, now.timestamp_millis()));
    }

    #[test]
    fn skipped_scheduled_weekday_forces_a_run() {
        let then = Utc.with_ymd_and_hms(2026, 1, 5, 23, 0, 0).unwrap(); // Monday
        let now = Utc.with_ymd_and_hms(2026, 1, 6, 8, 0, 0).unwrap(); // Tuesday
        let tuesday_bit = 1 << now.weekday().num_days_from_monday();

        let it = item(tuesday_bit, 700, then.timestamp_millis(), true);
        assert!(should_run(&it, now.timestamp_millis()));
    }

    #[test]
    fn plan_item_wire_decodes_and_clamps_days() {
        let wire: PlanItemWire = serde_json::from_str(
            r#"{"id":1,"channel":"daily","clock":2200,"days":255,"success":true,"paths":["/data"]}"#,
        )
        .unwrap();
        let plan_item = PlanItem::from(wire);
        assert_eq!(plan_item.days, 0b0111_1111);
        assert_eq!(plan_item.paths, vec![PathBuf::from("/data")]);
        assert_eq!(plan_item.timestamp, 0);
    }
}
