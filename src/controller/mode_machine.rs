//! Target-mode decision as a pure function of wall-clock time and the tariff signal.
//!
//! Nothing here is persisted: every tick recomputes the decision, so a restart
//! converges on the next evaluation.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use tracing::{debug, warn};

use crate::config::ScheduleConfig;
use crate::domain::{DecisionReason, Mode, ModeDecision};
use crate::forecast::{DayColor, TariffError, TariffSource};

#[derive(Debug, Clone, PartialEq)]
pub struct ModeSchedule {
    pub timezone: Tz,
    pub morning: NaiveTime,
    pub evening: NaiveTime,
    pub precharge_start: NaiveTime,
    pub precharge_end: NaiveTime,
    pub manual_power_w: u32,
    pub precharge_power_w: u32,
}

impl From<&ScheduleConfig> for ModeSchedule {
    fn from(cfg: &ScheduleConfig) -> Self {
        Self {
            timezone: cfg.timezone,
            morning: cfg.morning,
            evening: cfg.evening,
            precharge_start: cfg.precharge_start,
            precharge_end: cfg.precharge_end,
            manual_power_w: cfg.manual_power_w,
            precharge_power_w: cfg.precharge_power_w,
        }
    }
}

/// `start <= t < end`, wrapping past midnight when `end < start`. Empty when equal.
fn in_window(t: NaiveTime, start: NaiveTime, end: NaiveTime) -> bool {
    if start <= end {
        start <= t && t < end
    } else {
        t >= start || t < end
    }
}

impl ModeSchedule {
    pub fn is_auto_period(&self, local: NaiveTime) -> bool {
        in_window(local, self.morning, self.evening)
    }

    pub fn in_precharge_window(&self, local: NaiveTime) -> bool {
        in_window(local, self.precharge_start, self.precharge_end)
    }

    /// Day whose tariff matters at `now`: the day that begins at the next morning boundary.
    pub fn tariff_day(&self, now: DateTime<Utc>) -> NaiveDate {
        let local = now.with_timezone(&self.timezone);
        let date = local.date_naive();
        if local.time() < self.morning {
            date
        } else {
            date + ChronoDuration::days(1)
        }
    }

    /// Date to ask the tariff collaborator about, or `None` when the answer cannot change the decision.
    pub fn tariff_query(&self, now: DateTime<Utc>) -> Option<NaiveDate> {
        let local = now.with_timezone(&self.timezone).time();
        (!self.is_auto_period(local) && self.in_precharge_window(local)).then(|| self.tariff_day(now))
    }

    /// Decide the target mode. `tariff` is the answer for [`Self::tariff_query`], if one was made.
    pub fn evaluate(
        &self,
        now: DateTime<Utc>,
        tariff: Option<&Result<DayColor, TariffError>>,
    ) -> ModeDecision {
        let local = now.with_timezone(&self.timezone).time();
        let manual = Mode::Manual {
            power_w: self.manual_power_w,
        };
        let schedule = |mode, degraded| ModeDecision {
            mode,
            reason: DecisionReason::Schedule,
            degraded,
        };

        if self.is_auto_period(local) {
            return schedule(Mode::Auto, false);
        }
        if !self.in_precharge_window(local) {
            return schedule(manual, false);
        }
        match tariff {
            Some(Ok(DayColor::Peak)) => ModeDecision {
                mode: Mode::Precharge {
                    charge_w: self.precharge_power_w,
                },
                reason: DecisionReason::TariffPrecharge,
                degraded: false,
            },
            Some(Ok(DayColor::Normal)) => schedule(manual, false),
            Some(Err(_)) | None => schedule(manual, true),
        }
    }
}

/// Consult the tariff when it matters and evaluate. Tariff failures degrade to
/// plain scheduling; they never block a decision.
pub async fn decide(
    schedule: &ModeSchedule,
    tariff: &dyn TariffSource,
    now: DateTime<Utc>,
) -> ModeDecision {
    let answer = match schedule.tariff_query(now) {
        Some(day) => {
            let answer = tariff.day_color(day).await;
            match &answer {
                Ok(color) => debug!(%day, %color, "tariff consulted"),
                Err(e) => warn!(%day, error = %e, "tariff unavailable; falling back to schedule only"),
            }
            Some(answer)
        }
        None => None,
    };
    let decision = schedule.evaluate(now, answer.as_ref());
    debug!(
        mode = %decision.mode.kind(),
        reason = %decision.reason,
        degraded = decision.degraded,
        "mode decision"
    );
    decision
}
