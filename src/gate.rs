//! Precondition Gate.
//!
//! Runs before any provider call. For children in family organizations it
//! checks, in order, quiet hours, the daily credit limit and the
//! subscription. The first failing check is the only one reported. For every
//! member it then checks the model allowlist.
//!
//! Nothing here writes. The gate is re-evaluated from stored state on every
//! request.

use chrono::{DateTime, Duration, FixedOffset, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};
use crate::storage::LedgerStore;
use crate::types::{Member, MemberRole, Organization, ParentalControls, SupervisionMode};

/// Gate behavior switches.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateConfig {
    /// Evaluate family checks at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Reject models outside a member's allowlist.
    #[serde(default = "default_true")]
    pub enforce_model_allowlist: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            enforce_model_allowlist: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Whether `now` falls inside the quiet window `[start, end)`.
///
/// Windows whose start is after their end wrap midnight. An empty window
/// (start == end) never matches.
#[must_use]
pub fn in_quiet_hours(start: NaiveTime, end: NaiveTime, local: NaiveTime) -> bool {
    if start <= end {
        start <= local && local < end
    } else {
        local >= start || local < end
    }
}

/// UTC instant of local midnight on the local date of `at`.
#[must_use]
pub fn local_midnight(at: DateTime<Utc>, offset: FixedOffset) -> DateTime<Utc> {
    let midnight = at.with_timezone(&offset).date_naive().and_time(NaiveTime::MIN);
    (midnight - Duration::seconds(i64::from(offset.local_minus_utc()))).and_utc()
}

/// Start of the usage window and the allowance for it.
#[must_use]
pub fn allowance_window(
    controls: &ParentalControls,
    limit: Decimal,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, Decimal) {
    let offset = controls.local_offset();
    if !controls.cumulative_credits {
        return (local_midnight(now, offset), limit);
    }

    let anchor_day = controls.allowance_anchor.with_timezone(&offset).date_naive();
    let today = now.with_timezone(&offset).date_naive();
    let days = (today - anchor_day).num_days().max(0) + 1;
    (
        local_midnight(controls.allowance_anchor, offset),
        limit * Decimal::from(days),
    )
}

fn check_quiet_hours(controls: &ParentalControls, now: DateTime<Utc>) -> Result<()> {
    let (Some(start), Some(end)) = (controls.quiet_hours_start, controls.quiet_hours_end) else {
        return Ok(());
    };
    let local = now.with_timezone(&controls.local_offset()).time();
    if in_quiet_hours(start, end, local) {
        return Err(LedgerError::QuietHours {
            until: end.format("%H:%M").to_string(),
        });
    }
    Ok(())
}

/// Evaluates preconditions against stored state.
#[derive(Clone)]
pub struct PreconditionGate<S> {
    store: S,
    config: GateConfig,
}

impl<S: LedgerStore> PreconditionGate<S> {
    pub fn new(store: S, config: GateConfig) -> Self {
        Self { store, config }
    }

    /// Check whether `member` may make a request for `model` at `now`.
    #[tracing::instrument(skip(self, org, member), fields(org_id = %org.id, member_id = %member.id))]
    pub async fn evaluate(
        &self,
        org: &Organization,
        member: &Member,
        model: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.config.enabled && org.is_family() && member.role == MemberRole::Student {
            self.check_child(org, member, now).await?;
        }

        if self.config.enforce_model_allowlist {
            if let Some(model) = model {
                if !member.allows_model(model) {
                    return Err(LedgerError::ModelNotAllowed {
                        model: model.to_string(),
                    });
                }
            }
        }

        tracing::debug!("preconditions passed");
        Ok(())
    }

    async fn check_child(
        &self,
        org: &Organization,
        member: &Member,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let controls = self
            .store
            .get_parental_controls(&org.id, &member.id)
            .await?;

        if let Some(controls) = controls
            .as_ref()
            .filter(|c| c.supervision_mode != SupervisionMode::Adult)
        {
            check_quiet_hours(controls, now)?;

            if let Some(limit) = controls.daily_credit_limit {
                let (since, allowance) = allowance_window(controls, limit, now);
                let used = self.store.sum_usage(&member.user_id, since).await?;
                if used >= allowance {
                    return Err(LedgerError::DailyLimitReached {
                        limit: allowance,
                        used,
                    });
                }
            }
        }

        if !org.subscription.allows_usage(now) {
            return Err(LedgerError::TrialExpired);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_quiet_hours_wrap_midnight() {
        let (start, end) = (hm(22, 0), hm(7, 0));
        assert!(in_quiet_hours(start, end, hm(23, 30)));
        assert!(in_quiet_hours(start, end, hm(22, 0)));
        assert!(in_quiet_hours(start, end, hm(3, 0)));
        assert!(!in_quiet_hours(start, end, hm(7, 0)));
        assert!(!in_quiet_hours(start, end, hm(12, 0)));
    }

    #[test]
    fn test_quiet_hours_same_day() {
        let (start, end) = (hm(13, 0), hm(14, 0));
        assert!(in_quiet_hours(start, end, hm(13, 30)));
        assert!(!in_quiet_hours(start, end, hm(14, 0)));
        assert!(!in_quiet_hours(hm(9, 0), hm(9, 0), hm(9, 0)));
    }

    #[test]
    fn test_quiet_hours_use_local_offset() {
        let controls = ParentalControls::new("org", "m")
            .with_quiet_hours(hm(22, 0), hm(7, 0))
            .with_utc_offset(120);
        // 21:30 UTC is 23:30 at UTC+2
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 21, 30, 0).unwrap();
        assert_eq!(
            check_quiet_hours(&controls, now),
            Err(LedgerError::QuietHours {
                until: "07:00".into()
            })
        );
        // 06:00 UTC is 08:00 local
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 6, 0, 0).unwrap();
        assert!(check_quiet_hours(&controls, now).is_ok());
    }

    #[test]
    fn test_local_midnight() {
        let offset = FixedOffset::east_opt(-5 * 3600).unwrap();
        // 03:00 UTC on June 2 is 22:00 on June 1 at UTC-5
        let at = Utc.with_ymd_and_hms(2025, 6, 2, 3, 0, 0).unwrap();
        assert_eq!(
            local_midnight(at, offset),
            Utc.with_ymd_and_hms(2025, 6, 1, 5, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_cumulative_allowance_grows_per_day() {
        let anchor = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();
        let controls = ParentalControls::new("org", "m").with_cumulative(anchor);
        let now = Utc.with_ymd_and_hms(2025, 6, 3, 10, 0, 0).unwrap();

        let (since, allowance) = allowance_window(&controls, Decimal::new(50, 2), now);
        assert_eq!(since, Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap());
        assert_eq!(allowance, Decimal::new(150, 2));
    }

    #[test]
    fn test_non_cumulative_window_is_today() {
        let controls = ParentalControls::new("org", "m");
        let now = Utc.with_ymd_and_hms(2025, 6, 3, 10, 0, 0).unwrap();
        let (since, allowance) = allowance_window(&controls, Decimal::new(50, 2), now);
        assert_eq!(since, Utc.with_ymd_and_hms(2025, 6, 3, 0, 0, 0).unwrap());
        assert_eq!(allowance, Decimal::new(50, 2));
    }
}
