//! The monitoring state machine.
//!
//! One `tick` per frame. The controller owns every piece of temporal policy: the distress
//! streak with its asymmetric hysteresis, the interrupt cooldown, and the single in-flight
//! escalation job. Collaborators are injected and never report failures back into it.

use crate::{
    alarm::AlarmActuator,
    classify::Evidence,
    escalate::{EscalationPipeline, JobHandle},
    interrupt::InterruptSignal,
};
use std::{
    fmt,
    time::{Duration, Instant},
};
use tracing::{debug, info, instrument};

pub(crate) const DEFAULT_DISTRESS_THRESHOLD: u32 = 5;
pub(crate) const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ControllerState {
    Monitoring,
    Alarm,
    Escalating,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Monitoring => "MONITORING",
            Self::Alarm => "ALARM",
            Self::Escalating => "ESCALATING",
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Policy {
    /// Consecutive distressed frames needed to raise the alarm, and to clear it again.
    pub(crate) distress_threshold: u32,
    /// Minimum gap between honored interrupts.
    pub(crate) cooldown: Duration,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            distress_threshold: DEFAULT_DISTRESS_THRESHOLD,
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

pub(crate) struct DistressController<A, E, I> {
    alarm: A,
    escalation: E,
    interrupt: I,
    policy: Policy,
    state: ControllerState,
    streak: u32,
    last_interrupt: Option<Instant>,
    job: Option<JobHandle>,
    finished: Option<JobHandle>,
}

impl<A, E, I> DistressController<A, E, I>
where
    A: AlarmActuator,
    E: EscalationPipeline,
    I: InterruptSignal,
{
    pub(crate) fn new(alarm: A, escalation: E, interrupt: I, policy: Policy) -> Self {
        Self {
            alarm,
            escalation,
            interrupt,
            policy,
            state: ControllerState::Monitoring,
            streak: 0,
            last_interrupt: None,
            job: None,
            finished: None,
        }
    }

    pub(crate) fn state(&self) -> ControllerState {
        self.state
    }

    pub(crate) fn streak(&self) -> u32 {
        self.streak
    }

    /// The most recently completed escalation job, handed out once.
    pub(crate) fn take_finished_job(&mut self) -> Option<JobHandle> {
        self.finished.take()
    }

    /// Advance the machine by one frame.
    ///
    /// Interrupt handling always runs before evidence handling, so a pending press wins over
    /// a distress transition in the same tick.
    #[instrument(name = "DistressController::tick", skip(self, frame, evidence), level = "debug")]
    pub(crate) fn tick(
        &mut self,
        frame: &E::Frame,
        evidence: &Evidence,
        now: Instant,
    ) -> ControllerState {
        if self.state != ControllerState::Escalating && self.interrupt.take() {
            self.handle_interrupt(frame, evidence, now);
        }

        match self.state {
            ControllerState::Monitoring => self.monitor(evidence),
            ControllerState::Alarm => self.sound(evidence),
            ControllerState::Escalating => self.await_job(),
        }
        self.state
    }

    fn handle_interrupt(&mut self, frame: &E::Frame, evidence: &Evidence, now: Instant) {
        if let Some(last) = self.last_interrupt {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < self.policy.cooldown {
                info!(message = "interrupt ignored during cooldown", ?elapsed);
                return;
            }
        }

        if self.state == ControllerState::Alarm {
            self.alarm.stop();
        }
        self.last_interrupt = Some(now);
        self.job = Some(self.escalation.submit(frame, evidence));
        self.transition(ControllerState::Escalating, "interrupt");
    }

    fn monitor(&mut self, evidence: &Evidence) {
        if !evidence.is_distressed() {
            self.streak = 0;
            return;
        }
        self.streak += 1;
        debug!(message = "distress streak", streak = self.streak);
        if self.streak >= self.policy.distress_threshold {
            self.alarm.start();
            self.transition(ControllerState::Alarm, &evidence.reason());
        }
    }

    fn sound(&mut self, evidence: &Evidence) {
        if evidence.is_distressed() {
            self.streak = self.policy.distress_threshold;
            return;
        }
        self.streak = self.streak.saturating_sub(1);
        if self.streak == 0 {
            self.alarm.stop();
            self.transition(ControllerState::Monitoring, "distress cleared");
        }
    }

    fn await_job(&mut self) {
        let complete = match &self.job {
            Some(job) => self.escalation.is_complete(job),
            // nothing to wait for
            None => true,
        };
        if complete {
            self.finished = self.job.take();
            self.streak = 0;
            self.transition(ControllerState::Monitoring, "escalation finished");
        }
    }

    fn transition(&mut self, to: ControllerState, cause: &str) {
        info!(message = "state change", from = %self.state, %to, cause);
        self.state = to;
    }

    /// Stop the alarm, then the interrupt source. The caller releases the frame source after.
    pub(crate) fn shutdown(&mut self) {
        self.alarm.stop();
        self.interrupt.stop();
        info!(message = "controller shut down", state = %self.state);
    }

    #[cfg(test)]
    fn alarm(&self) -> &A {
        &self.alarm
    }

    #[cfg(test)]
    fn escalation(&self) -> &E {
        &self.escalation
    }
}
