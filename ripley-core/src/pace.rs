//! The pacer: translates captured event time into wall time through a
//! phase program, and the phase program parser itself.
//!
//! Two time axes are tracked deliberately (see DESIGN.md): phase changes
//! are driven by wall-clock elapse (a playback that falls behind still
//! finishes its phase schedule on time), while per-request delay is
//! driven by event-time extrapolation from the phase anchor (so
//! cumulative delay does not compound rounding error).

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use crate::error::Error;
use crate::metrics::Metrics;

/// One `(duration, rate)` segment of a phase program.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Phase {
    pub duration: Duration,
    pub rate: f64,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}",
            humantime::format_duration(self.duration),
            self.rate
        )
    }
}

/// An ordered, finite sequence of phases, e.g. `"10s@1 30s@1.5 1h@2"`.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseProgram {
    pub phases: Vec<Phase>,
}

impl PhaseProgram {
    /// Parse `"<dur>@<rate> <dur>@<rate> ..."`, tokens separated by
    /// whitespace. Fails with [`Error::BadPace`] on a malformed token or an
    /// empty program.
    pub fn parse(program: &str) -> Result<Self, Error> {
        let phases: Vec<Phase> = program
            .split_whitespace()
            .map(parse_phase_token)
            .collect::<Result<_, _>>()?;

        if phases.is_empty() {
            return Err(Error::BadPace(format!(
                "empty pace program: {program:?}"
            )));
        }

        Ok(PhaseProgram { phases })
    }
}

impl fmt::Display for PhaseProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.phases.iter().map(Phase::to_string).collect();
        f.write_str(&rendered.join(" "))
    }
}

fn parse_phase_token(token: &str) -> Result<Phase, Error> {
    let (dur_str, rate_str) = token
        .split_once('@')
        .ok_or_else(|| Error::BadPace(format!("phase {token:?} missing '@'")))?;

    let duration = humantime::parse_duration(dur_str)
        .map_err(|e| Error::BadPace(format!("bad duration in phase {token:?}: {e}")))?;

    let rate: f64 = rate_str
        .parse()
        .map_err(|e| Error::BadPace(format!("bad rate in phase {token:?}: {e}")))?;
    if !(rate > 0.0) || !rate.is_finite() {
        return Err(Error::BadPace(format!(
            "rate in phase {token:?} must be a positive finite number, got {rate}"
        )));
    }

    Ok(Phase { duration, rate })
}

struct PacerState {
    phases: VecDeque<Phase>,
    current_rate: f64,
    initialized: bool,
    phase_start_event_time: Option<DateTime<Utc>>,
    phase_start_wall: Option<Instant>,
    last_event_time: Option<DateTime<Utc>>,
    last_scheduled_wall: Option<Instant>,
    report_interval: Option<Duration>,
    next_report: Option<Instant>,
    requests_since_report: u64,
}

/// Maps event time onto wall time via a [`PhaseProgram`]. See module docs
/// and SPEC_FULL.md §4.1 for the algorithm.
pub struct Pacer {
    state: Mutex<PacerState>,
    done: AtomicBool,
    epoch_instant: Instant,
    epoch_calendar: DateTime<Utc>,
    metrics: Arc<Metrics>,
}

/// Phases aren't named; the metrics label is just their position in the
/// program ("0", "1", ...).
fn phase_label(index: usize) -> String {
    index.to_string()
}

impl Pacer {
    pub fn new(program: PhaseProgram, report_interval: Option<Duration>, metrics: Arc<Metrics>) -> Self {
        let current_rate = program.phases[0].rate;
        metrics.set_pacer_phase_rate(&phase_label(0), current_rate);
        Pacer {
            state: Mutex::new(PacerState {
                phases: program.phases.into(),
                current_rate,
                initialized: false,
                phase_start_event_time: None,
                phase_start_wall: None,
                last_event_time: None,
                last_scheduled_wall: None,
                report_interval,
                next_report: None,
                requests_since_report: 0,
            }),
            done: AtomicBool::new(false),
            epoch_instant: Instant::now(),
            epoch_calendar: Utc::now(),
            metrics,
        }
    }

    /// Arms the first phase's boundary timer. When it fires, advances to
    /// the next phase (or sets `done` if the program is exhausted) and
    /// rearms. Must be called exactly once, before the first
    /// [`Pacer::wait_duration_nanos`] call that should observe phase
    /// advancement.
    pub fn start(pacer: &std::sync::Arc<Self>) {
        let pacer = std::sync::Arc::clone(pacer);
        tokio::spawn(async move {
            let mut phase_index = 0usize;
            loop {
                let duration = {
                    let state = pacer.state.lock().unwrap();
                    match state.phases.front() {
                        Some(phase) => phase.duration,
                        None => break,
                    }
                };

                let phase_wall_start = Instant::now();
                tokio::time::sleep(duration).await;
                pacer.metrics.inc_pacer_phase_wall_seconds(
                    &phase_label(phase_index),
                    phase_wall_start.elapsed().as_secs_f64(),
                );

                let mut state = pacer.state.lock().unwrap();
                state.phases.pop_front();
                state.phase_start_event_time = state.last_event_time;
                state.phase_start_wall = state.last_scheduled_wall;
                phase_index += 1;

                match state.phases.front() {
                    Some(next) => {
                        state.current_rate = next.rate;
                        pacer
                            .metrics
                            .set_pacer_phase_rate(&phase_label(phase_index), next.rate);
                    }
                    None => {
                        pacer.done.store(true, Ordering::SeqCst);
                        tracing::debug!("pacer phase program exhausted");
                        break;
                    }
                }
            }
        });
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// Returns how long the caller should sleep (as signed nanoseconds;
    /// negative means "dispatch immediately") before issuing the request
    /// recorded at `event_ts`.
    pub fn wait_duration_nanos(&self, event_ts: DateTime<Utc>) -> i64 {
        if self.is_done() {
            return 0;
        }

        let now = Instant::now();
        let mut state = self.state.lock().unwrap();

        if !state.initialized {
            state.initialized = true;
            state.last_event_time = Some(event_ts);
            state.last_scheduled_wall = Some(now);
            state.phase_start_event_time = Some(event_ts);
            state.phase_start_wall = Some(now);
            self.tick_report(&mut state, now, now);
            return 0;
        }

        let phase_start_event = state
            .phase_start_event_time
            .expect("initialized implies phase_start_event_time is set");
        let phase_start_wall = state
            .phase_start_wall
            .expect("initialized implies phase_start_wall is set");
        let rate = state.current_rate;

        let delta_event_nanos = event_ts
            .signed_duration_since(phase_start_event)
            .num_nanoseconds()
            .unwrap_or(0);
        let delta_wall_nanos = (delta_event_nanos as f64 / rate).round() as i64;

        let target = offset_instant(phase_start_wall, delta_wall_nanos);

        state.last_event_time = Some(event_ts);
        state.last_scheduled_wall = Some(target);

        self.tick_report(&mut state, now, target);

        signed_nanos_between(now, target)
    }

    fn tick_report(&self, state: &mut PacerState, now: Instant, target: Instant) {
        state.requests_since_report += 1;
        let Some(interval) = state.report_interval else {
            return;
        };
        if interval.is_zero() {
            return;
        }

        let mut next_report = match state.next_report {
            Some(nr) => nr,
            None => {
                state.next_report = Some(now + interval);
                return;
            }
        };

        while next_report < target {
            let skew_nanos = signed_nanos_between(next_report, now);
            let rate = state.current_rate;
            let expected_rps =
                state.requests_since_report as f64 / interval.as_secs_f64().max(f64::EPSILON);
            let report_time = self.calendar_for(next_report);
            let last_request_time = state.last_event_time;

            tracing::info!(
                report_time = %report_time.to_rfc3339(),
                skew_seconds = skew_nanos as f64 / 1e9,
                last_request_time = ?last_request_time.map(|t| t.to_rfc3339()),
                rate,
                expected_rps,
                "pacer report"
            );

            state.requests_since_report = 0;
            next_report += interval;
        }
        state.next_report = Some(next_report);
    }

    fn calendar_for(&self, instant: Instant) -> DateTime<Utc> {
        match instant.checked_duration_since(self.epoch_instant) {
            Some(elapsed) => self.epoch_calendar + chrono::Duration::from_std(elapsed).unwrap_or_default(),
            None => {
                let behind = self.epoch_instant - instant;
                self.epoch_calendar - chrono::Duration::from_std(behind).unwrap_or_default()
            }
        }
    }
}

fn offset_instant(base: Instant, offset_nanos: i64) -> Instant {
    if offset_nanos >= 0 {
        base + Duration::from_nanos(offset_nanos as u64)
    } else {
        base.checked_sub(Duration::from_nanos((-offset_nanos) as u64))
            .unwrap_or(base)
    }
}

fn signed_nanos_between(from: Instant, to: Instant) -> i64 {
    match to.checked_duration_since(from) {
        Some(d) => d.as_nanos() as i64,
        None => -((from - to).as_nanos() as i64),
    }
}
