//! The schedule reconciler.
//!
//! One `reconcile()` call is one tick, and ticks never overlap: the run
//! loop awaits each tick and skips missed interval firings. A tick runs
//! three strictly ordered phases over fresh reads:
//!
//! - **A**: give LLM times to tasks still carrying fallback placeholders;
//! - **B**: reschedule slipped tasks (end passed, or start passed without
//!   the task being started);
//! - **C**: reprioritize the whole incomplete set, only when A or B
//!   changed something.
//!
//! LLM failures never propagate: phase A leaves the flag set for a later
//! tick (bounded by an attempt cap, after which the fallback window is
//! accepted), phase B leaves the row untouched, phase C leaves priorities
//! untouched.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use tempo_core::store::Store;
use tempo_core::time::{format_iso, now_local, safe_parse_iso};
use tempo_core::types::Task;
use tempo_llm::{
    LlmClient, PrioritizeInput, ScheduleEntry, ScheduleSlotInput, TaskForPrioritization,
};

use crate::shutdown::ShutdownSignal;

/// Failed phase-A ticks tolerated per task before the fallback window is
/// accepted and the flag cleared.
const MAX_SCHEDULING_ATTEMPTS: u32 = 3;

/// What one tick did.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickReport {
    pub scheduled: usize,
    pub rescheduled: usize,
    pub reprioritized: usize,
}

impl TickReport {
    pub fn changed(&self) -> bool {
        self.scheduled > 0 || self.rescheduled > 0
    }
}

pub struct Reconciler {
    store: Arc<Store>,
    llm: Arc<LlmClient>,
    /// Per-task count of failed initial-scheduling ticks.
    failed_attempts: Mutex<HashMap<i64, u32>>,
}

impl Reconciler {
    pub fn new(store: Arc<Store>, llm: Arc<LlmClient>) -> Self {
        Self {
            store,
            llm,
            failed_attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Drive ticks until shutdown. Missed firings are skipped, so ticks
    /// serialize even when one overruns the interval.
    pub async fn run(self: Arc<Self>, interval: Duration, shutdown: ShutdownSignal) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        let mut shutdown_rx = shutdown.subscribe();
        info!(interval_secs = interval.as_secs(), "reconciler loop started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.reconcile().await;
                    if report.changed() || report.reprioritized > 0 {
                        info!(
                            scheduled = report.scheduled,
                            rescheduled = report.rescheduled,
                            reprioritized = report.reprioritized,
                            "reconcile tick applied changes"
                        );
                    } else {
                        debug!("schedule is up to date");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("reconciler loop stopping");
                    break;
                }
            }
        }
    }

    /// One tick. Never fails; all errors are absorbed and logged.
    pub async fn reconcile(&self) -> TickReport {
        let now = now_local();
        let mut report = TickReport::default();
        report.scheduled = self.phase_a(now).await;
        report.rescheduled = self.phase_b(now).await;
        if report.changed() {
            report.reprioritized = self.phase_c().await;
        }
        report
    }

    // -----------------------------------------------------------------------
    // Phase A — initial scheduling
    // -----------------------------------------------------------------------

    async fn phase_a(&self, now: NaiveDateTime) -> usize {
        let pending = match self.store.get_tasks_needing_scheduling().await {
            Ok(tasks) => tasks,
            Err(err) => {
                error!(error = %err, "failed to list tasks needing scheduling");
                return 0;
            }
        };

        let mut scheduled = 0;
        for task in pending {
            let input = match self.slot_input(&task, now, &task.context).await {
                Some(input) => input,
                None => continue,
            };
            match self.llm.schedule_timeslot(input).await {
                Ok(slot) => {
                    let start = slot.start_time.as_deref().and_then(safe_parse_iso);
                    let end = slot.end_time.as_deref().and_then(safe_parse_iso);
                    if start.is_none() || end.is_none() {
                        warn!(
                            task_id = task.id,
                            raw_start = slot.start_time.as_deref().unwrap_or(""),
                            raw_end = slot.end_time.as_deref().unwrap_or(""),
                            "unparseable times from model, storing nulls"
                        );
                    }
                    match self.store.set_task_schedule(task.id, start, end).await {
                        Ok(true) => {
                            scheduled += 1;
                            self.failed_attempts.lock().await.remove(&task.id);
                            info!(task_id = task.id, title = %task.title, "task scheduled");
                        }
                        Ok(false) => debug!(task_id = task.id, "task vanished mid-schedule"),
                        Err(err) => {
                            error!(task_id = task.id, error = %err, "schedule write-back failed")
                        }
                    }
                }
                Err(err) => self.note_scheduling_failure(&task, &err).await,
            }
        }
        scheduled
    }

    /// Count a failed initial-scheduling attempt; after the cap, accept the
    /// fallback window already on the row and stop retrying.
    async fn note_scheduling_failure(&self, task: &Task, err: &tempo_llm::LlmError) {
        let mut failed = self.failed_attempts.lock().await;
        let attempts = failed.entry(task.id).or_insert(0);
        *attempts += 1;
        if *attempts >= MAX_SCHEDULING_ATTEMPTS {
            failed.remove(&task.id);
            warn!(
                task_id = task.id,
                error = %err,
                "initial scheduling failed {MAX_SCHEDULING_ATTEMPTS} ticks, accepting fallback window"
            );
            match self.store.clear_needs_scheduling(task.id).await {
                Ok(_) => {}
                Err(store_err) => {
                    error!(task_id = task.id, error = %store_err, "failed to clear scheduling flag")
                }
            }
        } else {
            error!(
                task_id = task.id,
                attempt = *attempts,
                error = %err,
                "initial scheduling failed, will retry next tick"
            );
        }
    }

    // -----------------------------------------------------------------------
    // Phase B — slipped tasks
    // -----------------------------------------------------------------------

    async fn phase_b(&self, now: NaiveDateTime) -> usize {
        let incomplete = match self.store.get_incomplete_tasks().await {
            Ok(tasks) => tasks,
            Err(err) => {
                error!(error = %err, "failed to list incomplete tasks");
                return 0;
            }
        };

        let mut rescheduled = 0;
        for task in incomplete {
            // Phase A owns tasks still awaiting their first model schedule.
            if task.needs_scheduling {
                continue;
            }
            let end_passed = task.scheduled_end.is_some_and(|end| end < now);
            let start_passed_unstarted = task.scheduled_start.is_some_and(|start| start < now)
                && task.actual_start.is_none();
            if !end_passed && !start_passed_unstarted {
                continue;
            }

            info!(
                task_id = task.id,
                title = %task.title,
                end_passed,
                "task slipped, rescheduling"
            );
            let context = if task.context.is_empty() {
                "Rescheduling overdue task"
            } else {
                &task.context
            };
            let input = match self.slot_input(&task, now, context).await {
                Some(input) => input,
                None => continue,
            };
            match self.llm.schedule_timeslot(input).await {
                Ok(slot) => {
                    let start = slot.start_time.as_deref().and_then(safe_parse_iso);
                    let end = slot.end_time.as_deref().and_then(safe_parse_iso);
                    match self.store.set_task_schedule(task.id, start, end).await {
                        Ok(true) => rescheduled += 1,
                        Ok(false) => debug!(task_id = task.id, "task vanished mid-reschedule"),
                        Err(err) => {
                            error!(task_id = task.id, error = %err, "reschedule write-back failed")
                        }
                    }
                }
                // Leave the row untouched; the next tick sees it again.
                Err(err) => error!(task_id = task.id, error = %err, "rescheduling failed"),
            }
        }
        rescheduled
    }

    // -----------------------------------------------------------------------
    // Phase C — reprioritization
    // -----------------------------------------------------------------------

    async fn phase_c(&self) -> usize {
        let incomplete = match self.store.get_incomplete_tasks().await {
            Ok(tasks) => tasks,
            Err(err) => {
                error!(error = %err, "failed to list tasks for prioritization");
                return 0;
            }
        };
        if incomplete.is_empty() {
            return 0;
        }

        let global_context = self.global_context().await;
        let inputs: Vec<TaskForPrioritization> = incomplete
            .iter()
            .map(|t| TaskForPrioritization {
                id: t.id,
                title: t.title.clone(),
                description: t.description.clone(),
                due_date: t.due_date.as_ref().map(format_iso),
            })
            .collect();

        let scored = match self
            .llm
            .prioritize(PrioritizeInput {
                tasks: inputs,
                global_context,
            })
            .await
        {
            Ok(scored) => scored,
            Err(err) => {
                error!(error = %err, "prioritization failed, keeping existing priorities");
                return 0;
            }
        };

        let known: HashSet<i64> = incomplete.iter().map(|t| t.id).collect();
        let mut updated = 0;
        for entry in scored {
            if !known.contains(&entry.id) {
                debug!(task_id = entry.id, "prioritizer returned unknown id, ignoring");
                continue;
            }
            match self.store.set_task_priority(entry.id, entry.priority).await {
                Ok(true) => {
                    updated += 1;
                    debug!(
                        task_id = entry.id,
                        priority = entry.priority,
                        reasoning = %entry.reasoning,
                        "priority updated"
                    );
                }
                Ok(false) => debug!(task_id = entry.id, "task vanished before priority update"),
                Err(err) => error!(task_id = entry.id, error = %err, "priority write failed"),
            }
        }
        updated
    }

    // -----------------------------------------------------------------------
    // Input assembly
    // -----------------------------------------------------------------------

    /// Build the timeslot input for one task: the current schedule without
    /// the task itself and without completed tasks.
    async fn slot_input(
        &self,
        task: &Task,
        now: NaiveDateTime,
        context: &str,
    ) -> Option<ScheduleSlotInput> {
        let scheduled = match self.store.get_scheduled_tasks().await {
            Ok(tasks) => tasks,
            Err(err) => {
                error!(task_id = task.id, error = %err, "failed to snapshot schedule");
                return None;
            }
        };
        let existing_schedule: Vec<ScheduleEntry> = scheduled
            .iter()
            .filter(|t| t.id != task.id && !t.completed)
            .filter_map(|t| {
                let start = t.scheduled_start?;
                let end = t.scheduled_end?;
                Some(ScheduleEntry {
                    id: t.id,
                    title: t.title.clone(),
                    start_time: format_iso(&start),
                    end_time: format_iso(&end),
                })
            })
            .collect();

        Some(ScheduleSlotInput {
            task_title: task.title.clone(),
            task_context: context.to_string(),
            global_context: self.global_context().await,
            current_datetime: format_iso(&now),
            existing_schedule,
        })
    }

    async fn global_context(&self) -> String {
        match self.store.get_or_create_context().await {
            Ok(row) => row.context,
            Err(err) => {
                warn!(error = %err, "failed to read global context, using empty");
                String::new()
            }
        }
    }
}
