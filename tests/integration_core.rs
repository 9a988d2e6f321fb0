use agency_desk::{
    CrmCore, Database, FieldKind, FormField, LeadFormSubmission, ListLeadsFilters,
    ListMeetingsFilters, MeetingStatus, MetricRecord, PostBulletinPayload, RecordMetricsPayload,
    Role, SaveFormDefinitionPayload, SaveProfilePayload, SaveTeamPayload, ScheduleMeetingPayload,
    TeamMembership,
};
use chrono::{Duration, Utc};
use std::sync::Arc;

const PERIOD: &str = "2026-08";

fn profile(email: &str, roles: Vec<Role>, manager_email: Option<&str>) -> SaveProfilePayload {
    SaveProfilePayload {
        id: None,
        email: email.to_string(),
        display_name: email.split('@').next().unwrap_or(email).to_string(),
        roles,
        manager_email: manager_email.map(ToString::to_string),
    }
}

fn record(leads: u32, contacts: u32, scheduled: u32, sits: u32, sales: u32, ap_cents: i64) -> MetricRecord {
    MetricRecord {
        leads,
        calls: 0,
        contacts,
        scheduled,
        sits,
        sales,
        ap_cents,
    }
}

/// Admin plus a two-level org: m manages Alpha (a, b); a manages Bravo (c).
async fn seeded_core() -> (tempfile::TempDir, CrmCore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let db = Database::new(&dir.path().join("crm.db")).expect("db");

    db.save_profile(profile("root@agency.test", vec![Role::Admin], None))
        .expect("admin");
    let m = db
        .save_profile(profile(
            "m@agency.test",
            vec![Role::Agent, Role::Manager],
            None,
        ))
        .expect("m");
    let a = db
        .save_profile(profile(
            "a@agency.test",
            vec![Role::Agent, Role::Manager],
            Some("m@agency.test"),
        ))
        .expect("a");
    let b = db
        .save_profile(profile(
            "b@agency.test",
            vec![Role::Agent],
            Some("m@agency.test"),
        ))
        .expect("b");
    let c = db
        .save_profile(profile(
            "c@agency.test",
            vec![Role::Agent],
            Some("a@agency.test"),
        ))
        .expect("c");

    let alpha = db
        .save_team(SaveTeamPayload {
            id: None,
            name: "Alpha".to_string(),
            manager_email: "m@agency.test".to_string(),
        })
        .expect("alpha");
    let bravo = db
        .save_team(SaveTeamPayload {
            id: None,
            name: "Bravo".to_string(),
            manager_email: "a@agency.test".to_string(),
        })
        .expect("bravo");

    let membership = |team_id: &str, user_id: &str| TeamMembership {
        team_id: team_id.to_string(),
        user_id: user_id.to_string(),
        role: Role::Agent,
    };
    db.set_team_members(&alpha.id, &[membership(&alpha.id, &a.id), membership(&alpha.id, &b.id)])
        .expect("alpha members");
    db.set_team_members(&bravo.id, &[membership(&bravo.id, &c.id)])
        .expect("bravo members");

    let core = CrmCore::with_database(Arc::new(db));
    core.sign_in("root@agency.test").await.expect("sign in");

    for (user, metrics) in [
        (&m, record(100, 40, 20, 15, 5, 250_000)),
        (&a, record(10, 4, 2, 2, 1, 50_000)),
        (&b, record(20, 8, 4, 3, 1, 75_000)),
        (&c, record(30, 12, 6, 4, 2, 125_000)),
    ] {
        core.record_metrics(RecordMetricsPayload {
            user_id: user.id.clone(),
            period: PERIOD.to_string(),
            metrics,
        })
        .await
        .expect("record metrics");
    }

    (dir, core)
}

#[tokio::test]
async fn team_overview_rolls_up_the_whole_subtree() {
    let (_dir, core) = seeded_core().await;

    let overview = core.team_overview(PERIOD).await.expect("overview");
    assert!(!overview.flat_fallback);
    assert_eq!(overview.teams.len(), 1, "bravo folds under alpha");

    let alpha = &overview.teams[0];
    assert_eq!(alpha.team.name, "Alpha");
    // m + a + b + c, each exactly once
    assert_eq!(alpha.totals.leads, 160);
    assert_eq!(alpha.totals.sales, 9);
    assert_eq!(alpha.totals.ap_cents, 500_000);

    let lead_to_contact = alpha
        .ratios
        .iter()
        .find(|ratio| ratio.label == "Lead to Contact")
        .expect("ratio present");
    assert_eq!(lead_to_contact.value, "40.0%");
}

#[tokio::test]
async fn org_overview_matches_reference_ratios() {
    let (_dir, core) = seeded_core().await;

    let org = core.org_overview(PERIOD).await.expect("org overview");
    assert_eq!(org.totals.leads, 160);

    let ap_per_sale = org
        .ratios
        .iter()
        .find(|ratio| ratio.label == "AP per Sale")
        .expect("ratio present");
    // 500000 cents over 9 sales, rounded half up
    assert_eq!(ap_per_sale.value, "$555.56");
}

#[tokio::test]
async fn intake_form_rejects_bad_payloads_and_captures_good_ones() {
    let (_dir, core) = seeded_core().await;

    let form = core
        .save_form_definition(SaveFormDefinitionPayload {
            id: None,
            name: "Final Expense Intake".to_string(),
            fields: vec![
                FormField {
                    key: "clientName".to_string(),
                    label: "Client name".to_string(),
                    kind: FieldKind::Text,
                    required: true,
                    options: None,
                },
                FormField {
                    key: "email".to_string(),
                    label: "Email".to_string(),
                    kind: FieldKind::Email,
                    required: false,
                    options: None,
                },
            ],
        })
        .await
        .expect("save form");

    let err = core
        .submit_lead_form(LeadFormSubmission {
            form_id: form.id.clone(),
            values: serde_json::json!({ "email": "dana@example.com" }),
        })
        .await
        .expect_err("missing clientName rejected");
    assert!(err.to_string().contains("clientName"));

    let lead = core
        .submit_lead_form(LeadFormSubmission {
            form_id: form.id.clone(),
            values: serde_json::json!({
                "clientName": "Dana Fox",
                "email": "dana@example.com",
            }),
        })
        .await
        .expect("lead captured");
    assert_eq!(lead.client_name, "Dana Fox");

    let listed = core
        .list_leads(ListLeadsFilters::default())
        .await
        .expect("list leads");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, lead.id);
}

#[tokio::test]
async fn agents_see_only_their_own_leads() {
    let (_dir, core) = seeded_core().await;

    let form = core
        .save_form_definition(SaveFormDefinitionPayload {
            id: None,
            name: "Quick Intake".to_string(),
            fields: vec![FormField {
                key: "clientName".to_string(),
                label: "Client name".to_string(),
                kind: FieldKind::Text,
                required: true,
                options: None,
            }],
        })
        .await
        .expect("save form");

    core.submit_lead_form(LeadFormSubmission {
        form_id: form.id.clone(),
        values: serde_json::json!({ "clientName": "Root's Lead" }),
    })
    .await
    .expect("admin lead");

    core.sign_in("b@agency.test").await.expect("sign in b");
    core.submit_lead_form(LeadFormSubmission {
        form_id: form.id,
        values: serde_json::json!({ "clientName": "B's Lead" }),
    })
    .await
    .expect("b lead");

    let visible = core
        .list_leads(ListLeadsFilters::default())
        .await
        .expect("list leads as agent");
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].client_name, "B's Lead");
}

#[tokio::test]
async fn bulletins_are_role_gated_and_pinned_first() {
    let (_dir, core) = seeded_core().await;

    core.sign_in("b@agency.test").await.expect("sign in agent");
    let err = core
        .post_bulletin(PostBulletinPayload {
            title: "Hello".to_string(),
            body: "World".to_string(),
            expires_at: None,
        })
        .await
        .expect_err("agents cannot post");
    assert!(err.to_string().contains("manager"));

    core.sign_in("m@agency.test").await.expect("sign in manager");
    let first = core
        .post_bulletin(PostBulletinPayload {
            title: "Weekly numbers".to_string(),
            body: "Push sits this week.".to_string(),
            expires_at: None,
        })
        .await
        .expect("manager posts");
    let second = core
        .post_bulletin(PostBulletinPayload {
            title: "Office closed Friday".to_string(),
            body: "Back Monday.".to_string(),
            expires_at: None,
        })
        .await
        .expect("second bulletin");

    core.pin_bulletin(&first.id, true).await.expect("pin");
    let listed = core.list_bulletins(false).await.expect("list");
    assert_eq!(listed[0].id, first.id, "pinned bulletin sorts first");
    assert!(listed.iter().any(|bulletin| bulletin.id == second.id));
}

#[tokio::test]
async fn meetings_reject_overlaps_and_enforce_transitions() {
    let (_dir, core) = seeded_core().await;
    core.sign_in("m@agency.test").await.expect("sign in manager");

    let profiles = core.list_profiles().await.expect("profiles");
    let report = profiles
        .iter()
        .find(|profile| profile.email == "b@agency.test")
        .expect("report exists");

    let start = Utc::now() + Duration::days(1);
    let meeting = core
        .schedule_meeting(ScheduleMeetingPayload {
            report_id: report.id.clone(),
            scheduled_at: start,
            duration_minutes: 30,
            agenda: Some("Pipeline review".to_string()),
        })
        .await
        .expect("schedule");

    let err = core
        .schedule_meeting(ScheduleMeetingPayload {
            report_id: report.id.clone(),
            scheduled_at: start + Duration::minutes(15),
            duration_minutes: 30,
            agenda: None,
        })
        .await
        .expect_err("overlap rejected");
    assert!(err.to_string().contains("Overlaps"));

    let completed = core
        .set_meeting_status(&meeting.id, MeetingStatus::Completed)
        .await
        .expect("complete");
    assert_eq!(completed.status, MeetingStatus::Completed);

    let err = core
        .set_meeting_status(&meeting.id, MeetingStatus::Canceled)
        .await
        .expect_err("terminal state");
    assert!(err.to_string().contains("cannot move"));

    let scheduled = core
        .list_meetings(ListMeetingsFilters {
            manager_id: Some(meeting.manager_id.clone()),
            status: Some(MeetingStatus::Scheduled),
            ..ListMeetingsFilters::default()
        })
        .await
        .expect("list meetings");
    assert!(scheduled.is_empty());
}

#[tokio::test]
async fn diagnostics_capture_hierarchy_degradation() {
    let (_dir, core) = seeded_core().await;

    core.database()
        .save_team(SaveTeamPayload {
            id: None,
            name: "Ghost Team".to_string(),
            manager_email: "nobody@agency.test".to_string(),
        })
        .expect("ghost team");

    let overview = core.team_overview(PERIOD).await.expect("overview");
    assert_eq!(overview.teams.len(), 2, "ghost team still renders");

    let diagnostics = core.recent_diagnostics(20).await.expect("diagnostics");
    assert!(diagnostics
        .iter()
        .any(|event| event.code == "missing-manager"));
}
