use crate::errors::{AppError, AppResult};
use crate::models::{Meeting, MeetingStatus, ScheduleMeetingPayload};
use chrono::Duration;

/// Half-open interval overlap on the manager's calendar. Only meetings
/// still in `scheduled` state can conflict.
pub fn find_conflict<'a>(
    existing: &'a [Meeting],
    payload: &ScheduleMeetingPayload,
) -> Option<&'a Meeting> {
    let start = payload.scheduled_at;
    let end = start + Duration::minutes(i64::from(payload.duration_minutes));
    existing
        .iter()
        .filter(|meeting| meeting.status == MeetingStatus::Scheduled)
        .find(|meeting| {
            let meeting_end =
                meeting.scheduled_at + Duration::minutes(i64::from(meeting.duration_minutes));
            meeting.scheduled_at < end && start < meeting_end
        })
}

pub fn check_transition(from: MeetingStatus, to: MeetingStatus) -> AppResult<()> {
    let allowed = matches!(
        (from, to),
        (
            MeetingStatus::Scheduled,
            MeetingStatus::Completed | MeetingStatus::Canceled
        )
    );
    if allowed {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "Meeting cannot move from {} to {}",
            from.as_str(),
            to.as_str()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::{check_transition, find_conflict};
    use crate::models::{Meeting, MeetingStatus, ScheduleMeetingPayload};
    use chrono::{DateTime, Duration, Utc};

    // fixtures share one base instant so back-to-back windows really touch
    fn meeting(
        base: DateTime<Utc>,
        offset_minutes: i64,
        duration: u32,
        status: MeetingStatus,
    ) -> Meeting {
        Meeting {
            id: "mtg".to_string(),
            manager_id: "m".to_string(),
            report_id: "a".to_string(),
            scheduled_at: base + Duration::minutes(offset_minutes),
            duration_minutes: duration,
            agenda: None,
            status,
            created_at: base,
            updated_at: base,
        }
    }

    fn payload(base: DateTime<Utc>, offset_minutes: i64, duration: u32) -> ScheduleMeetingPayload {
        ScheduleMeetingPayload {
            report_id: "b".to_string(),
            scheduled_at: base + Duration::minutes(offset_minutes),
            duration_minutes: duration,
            agenda: None,
        }
    }

    #[test]
    fn overlapping_scheduled_meeting_conflicts() {
        let base = Utc::now();
        let existing = vec![meeting(base, 0, 30, MeetingStatus::Scheduled)];
        assert!(find_conflict(&existing, &payload(base, 15, 30)).is_some());
        assert!(find_conflict(&existing, &payload(base, 30, 30)).is_none());
        assert!(find_conflict(&existing, &payload(base, -30, 30)).is_none());
    }

    #[test]
    fn canceled_meetings_do_not_conflict() {
        let base = Utc::now();
        let existing = vec![meeting(base, 0, 60, MeetingStatus::Canceled)];
        assert!(find_conflict(&existing, &payload(base, 10, 30)).is_none());
    }

    #[test]
    fn only_scheduled_meetings_can_transition() {
        check_transition(MeetingStatus::Scheduled, MeetingStatus::Completed).expect("complete");
        check_transition(MeetingStatus::Scheduled, MeetingStatus::Canceled).expect("cancel");
        assert!(check_transition(MeetingStatus::Completed, MeetingStatus::Canceled).is_err());
        assert!(check_transition(MeetingStatus::Canceled, MeetingStatus::Scheduled).is_err());
    }
}
