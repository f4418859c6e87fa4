//! Proactive re-engagement: morning wake-ups and inactivity nudges.
//!
//! Both jobs share one discipline: query a capped candidate batch, send each
//! user one randomly chosen line, and stamp `last_notified_at` only after a
//! successful send. A failed send is logged and skipped so the rest of the
//! batch still goes out. Delivery is best effort, at most once per window.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, FixedOffset, NaiveTime, TimeZone, Timelike, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::SchedulerConfig;
use crate::events::{BotEvent, EventSink};
use crate::session::{SessionManager, UserSession};
use crate::store::{NudgeQuery, Suppression};
use crate::transport::ChatTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReengagementJob {
    MorningWake,
    InactivityNudge,
}

impl ReengagementJob {
    pub fn as_str(self) -> &'static str {
        match self {
            ReengagementJob::MorningWake => "morning_wake",
            ReengagementJob::InactivityNudge => "inactivity_nudge",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub job: ReengagementJob,
    /// Outside the job's active hours; nothing was queried.
    pub skipped: bool,
    pub candidates: usize,
    pub dispatched: usize,
    pub failed: usize,
}

impl CycleReport {
    fn new(job: ReengagementJob) -> Self {
        Self {
            job,
            skipped: false,
            candidates: 0,
            dispatched: 0,
            failed: 0,
        }
    }

    fn skipped(job: ReengagementJob) -> Self {
        Self {
            skipped: true,
            ..Self::new(job)
        }
    }
}

/// `hour` in `[start, end)`, wrapping past midnight when `start > end`.
pub fn hour_in_window(hour: u32, start: u32, end: u32) -> bool {
    if start <= end {
        (start..end).contains(&hour)
    } else {
        hour >= start || hour < end
    }
}

pub struct ReengagementScheduler {
    transport: Arc<dyn ChatTransport>,
    sessions: Arc<SessionManager>,
    config: SchedulerConfig,
    offset: FixedOffset,
    rng: Mutex<StdRng>,
    events: EventSink,
}

impl ReengagementScheduler {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        sessions: Arc<SessionManager>,
        config: SchedulerConfig,
        utc_offset_minutes: i32,
        rng: StdRng,
        events: EventSink,
    ) -> Result<Self> {
        let offset = FixedOffset::east_opt(utc_offset_minutes * 60)
            .ok_or_else(|| anyhow!("Invalid UTC offset of {} minutes", utc_offset_minutes))?;
        Ok(Self {
            transport,
            sessions,
            config,
            offset,
            rng: Mutex::new(rng),
            events,
        })
    }

    fn local_hour(&self, now: DateTime<Utc>) -> u32 {
        now.with_timezone(&self.offset).hour()
    }

    /// Today's local cutoff instant, in UTC.
    fn morning_cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let time = NaiveTime::from_hms_opt(self.config.morning_cutoff_hour, 0, 0)?;
        let local_date = now.with_timezone(&self.offset).date_naive();
        self.offset
            .from_local_datetime(&local_date.and_time(time))
            .single()
            .map(|at| at.with_timezone(&Utc))
    }

    pub async fn run_morning_wake(&self, now: DateTime<Utc>) -> CycleReport {
        let job = ReengagementJob::MorningWake;
        let hour = self.local_hour(now);
        if !hour_in_window(hour, self.config.morning_start_hour, self.config.morning_end_hour) {
            return CycleReport::skipped(job);
        }
        let Some(cutoff) = self.morning_cutoff(now) else {
            tracing::warn!(
                "Morning cutoff hour {} is invalid, skipping wake cycle",
                self.config.morning_cutoff_hour
            );
            return CycleReport::skipped(job);
        };

        let query = NudgeQuery {
            seen_from: None,
            // Strictly before the cutoff; stored timestamps have millisecond precision.
            seen_to: cutoff - chrono::Duration::milliseconds(1),
            suppression: Suppression::Since(cutoff),
            limit: self.config.morning_batch_size,
        };
        self.dispatch(job, &query, &self.config.morning_messages, now)
            .await
    }

    pub async fn run_inactivity_nudge(&self, now: DateTime<Utc>) -> CycleReport {
        let job = ReengagementJob::InactivityNudge;
        let hour = self.local_hour(now);
        if hour_in_window(hour, self.config.quiet_start_hour, self.config.quiet_end_hour) {
            return CycleReport::skipped(job);
        }

        let query = NudgeQuery {
            seen_from: Some(now - chrono::Duration::minutes(self.config.nudge_max_inactive_mins)),
            seen_to: now - chrono::Duration::minutes(self.config.nudge_min_inactive_mins),
            suppression: Suppression::SinceLastSeen,
            limit: self.config.nudge_batch_size,
        };
        self.dispatch(job, &query, &self.config.nudge_messages, now)
            .await
    }

    async fn dispatch(
        &self,
        job: ReengagementJob,
        query: &NudgeQuery,
        messages: &[String],
        now: DateTime<Utc>,
    ) -> CycleReport {
        let mut report = CycleReport::new(job);
        if messages.is_empty() {
            tracing::warn!("No messages configured for {}, skipping", job.as_str());
            report.skipped = true;
            return report;
        }

        let candidates: Vec<UserSession> = match self.sessions.store().find_nudge_candidates(query) {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::warn!("{}: candidate query failed: {:#}", job.as_str(), e);
                return report;
            }
        };
        report.candidates = candidates.len();

        for session in candidates {
            let text = {
                let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                messages.choose(&mut *rng).cloned().unwrap_or_default()
            };

            match self.transport.send_text(session.user_id, &text).await {
                Ok(()) => {
                    if let Err(e) = self.sessions.mark_notified(session.user_id, now) {
                        tracing::warn!(
                            "{}: sent to user {} but failed to stamp: {:#}",
                            job.as_str(),
                            session.user_id,
                            e
                        );
                    }
                    report.dispatched += 1;
                    self.events.emit(BotEvent::NotificationDispatched {
                        user_id: session.user_id,
                        job,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        "{}: failed to notify user {}: {:#}",
                        job.as_str(),
                        session.user_id,
                        e
                    );
                    report.failed += 1;
                    self.events.emit(BotEvent::NotificationFailed {
                        user_id: session.user_id,
                        job,
                        error: e.to_string(),
                    });
                }
            }
        }

        if report.candidates > 0 {
            tracing::info!(
                "{} cycle: {} candidates, {} sent, {} failed",
                job.as_str(),
                report.candidates,
                report.dispatched,
                report.failed
            );
        }
        self.events.emit(BotEvent::CycleCompleted(report.clone()));
        report
    }

    /// Run both jobs on their own intervals until the runtime shuts down.
    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let morning_every = Duration::from_secs(self.config.morning_interval_mins.max(1) * 60);
        let nudge_every = Duration::from_secs(self.config.nudge_interval_mins.max(1) * 60);

        let morning = {
            let scheduler = self.clone();
            tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval_at(tokio::time::Instant::now() + morning_every, morning_every);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    scheduler.run_morning_wake(Utc::now()).await;
                }
            })
        };

        let nudge = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + nudge_every, nudge_every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.run_inactivity_nudge(Utc::now()).await;
            }
        });

        tracing::info!(
            "Re-engagement scheduler started (morning every {:?}, nudge every {:?})",
            morning_every,
            nudge_every
        );
        vec![morning, nudge]
    }
}
