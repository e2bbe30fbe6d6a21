// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! End-to-end tests for the session engine: claims, heartbeats, risk
//! accumulation, signature rotation, PIN handling, and admin control.

mod common;

use chrono::Duration;
use common::{create_and_claim, engine};

use examgate::broadcast::EventType;
use examgate::error::EngineError;
use examgate::model::{Role, SessionStatus};
use examgate::risk::HeartbeatSignals;
use examgate::store::{
    ClaimSessionInput, CreateSessionInput, HeartbeatInput, ReconnectInput, ReportEventInput,
    SetProctorPinInput, VerifyPinOutcome,
};

fn clean_heartbeat() -> HeartbeatInput {
    HeartbeatInput {
        signals: HeartbeatSignals::default(),
        risk_score: 0,
    }
}

fn focus_lost_heartbeat() -> HeartbeatInput {
    HeartbeatInput {
        signals: HeartbeatSignals {
            focus: false,
            ..HeartbeatSignals::default()
        },
        risk_score: 0,
    }
}

// =============================================================================
// Session Creation & Claim
// =============================================================================

#[tokio::test]
async fn create_session_mints_prefixed_tokens_and_seeds_whitelist() {
    let env = engine();
    let created = env
        .store
        .create_session(CreateSessionInput {
            exam_name: "Physics Final".to_string(),
            created_by: "mr-osei".to_string(),
            token_count: 4,
            launch_url: Some("docs.google.com/forms/d/e/abc/viewform".to_string()),
            token_ttl_minutes: None,
        })
        .await
        .expect("create");

    assert_eq!(created.session.status, SessionStatus::Active);
    assert_eq!(created.student_tokens.len(), 3);
    assert!(created.student_tokens.iter().all(|t| t.starts_with("S-")));
    assert!(created.admin_tokens[0].starts_with("A-"));
    // Defaults plus the normalized launch URL.
    assert!(created
        .whitelist
        .contains(&"https://docs.google.com/forms/d/e/abc/viewform".to_string()));
    assert_eq!(
        created.launch_url.as_deref(),
        Some("https://docs.google.com/forms/d/e/abc/viewform")
    );
    assert_eq!(env.sink.types(), vec![EventType::SessionCreated]);
}

#[tokio::test]
async fn create_session_rejects_empty_exam_name() {
    let env = engine();
    let err = env
        .store
        .create_session(CreateSessionInput {
            exam_name: "   ".to_string(),
            created_by: "x".to_string(),
            token_count: 2,
            launch_url: None,
            token_ttl_minutes: None,
        })
        .await
        .expect_err("must fail");
    assert!(matches!(err, EngineError::Validation { .. }));
    assert_eq!(err.code(), "EXAM_NAME_REQUIRED");
}

#[tokio::test]
async fn first_claim_promotes_session_and_starts_at_zero_risk() {
    let env = engine();
    let claimed = create_and_claim(&env).await;

    let auth = env
        .store
        .authenticate(&claimed.student_signature)
        .await
        .expect("authenticate");
    assert_eq!(auth.session.status, SessionStatus::InProgress);
    assert_eq!(auth.binding.risk_score, 0);
    assert_eq!(auth.binding.signature_version, 1);
    assert_eq!(auth.binding.role, Role::Student);
    // Raw fingerprint never stored.
    assert_ne!(auth.binding.fingerprint_hash, "student-device-1");
}

#[tokio::test]
async fn student_token_claims_exactly_once() {
    let env = engine();
    let claimed = create_and_claim(&env).await;

    let err = env
        .store
        .claim_session(ClaimSessionInput {
            token: claimed.student_token.clone(),
            fingerprint: "another-device".to_string(),
            role: Role::Student,
        })
        .await
        .expect_err("second claim must fail");
    assert_eq!(err.code(), "TOKEN_CLAIMED");
    assert!(matches!(err, EngineError::Conflict { .. }));
}

#[tokio::test]
async fn concurrent_claims_of_one_token_admit_exactly_one_device() {
    let env = engine();
    let created = env
        .store
        .create_session(CreateSessionInput {
            exam_name: "Race".to_string(),
            created_by: "t".to_string(),
            token_count: 2,
            launch_url: None,
            token_ttl_minutes: None,
        })
        .await
        .expect("create");
    let token = created.student_tokens[0].clone();

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = env.store.clone();
        let token = token.clone();
        handles.push(tokio::spawn(async move {
            store
                .claim_session(ClaimSessionInput {
                    token,
                    fingerprint: format!("device-{i}"),
                    role: Role::Student,
                })
                .await
        }));
    }

    let mut successes = 0;
    for handle in handles {
        if handle.await.expect("task").is_ok() {
            successes += 1;
        }
    }
    assert_eq!(successes, 1);
}

#[tokio::test]
async fn expired_token_returns_gone() {
    let env = engine();
    let created = env
        .store
        .create_session(CreateSessionInput {
            exam_name: "Late".to_string(),
            created_by: "t".to_string(),
            token_count: 2,
            launch_url: None,
            token_ttl_minutes: Some(30),
        })
        .await
        .expect("create");

    env.clock.advance(Duration::minutes(31));

    let err = env
        .store
        .claim_session(ClaimSessionInput {
            token: created.student_tokens[0].clone(),
            fingerprint: "d".to_string(),
            role: Role::Student,
        })
        .await
        .expect_err("expired");
    assert_eq!(err.code(), "TOKEN_EXPIRED");
    assert!(matches!(err, EngineError::Expired { .. }));
}

#[tokio::test]
async fn claim_with_wrong_role_is_rejected() {
    let env = engine();
    let created = env
        .store
        .create_session(CreateSessionInput {
            exam_name: "Roles".to_string(),
            created_by: "t".to_string(),
            token_count: 2,
            launch_url: None,
            token_ttl_minutes: None,
        })
        .await
        .expect("create");

    let err = env
        .store
        .claim_session(ClaimSessionInput {
            token: created.student_tokens[0].clone(),
            fingerprint: "d".to_string(),
            role: Role::Admin,
        })
        .await
        .expect_err("role mismatch");
    assert_eq!(err.code(), "ROLE_MISMATCH");
}

#[tokio::test]
async fn admin_token_reclaims_only_from_the_same_device() {
    let env = engine();
    let claimed = create_and_claim(&env).await;

    // Same fingerprint: allowed, rotates the signature.
    let again = env
        .store
        .claim_session(ClaimSessionInput {
            token: claimed.admin_token.clone(),
            fingerprint: "proctor-tablet-1".to_string(),
            role: Role::Admin,
        })
        .await
        .expect("same-device reclaim");
    assert_eq!(again.binding_id, claimed.admin_binding);
    assert_ne!(again.signature, claimed.admin_signature);

    // The old admin signature is now a dead version.
    let err = env
        .store
        .authenticate(&claimed.admin_signature)
        .await
        .expect_err("old signature dead");
    assert_eq!(err.code(), "SIGNATURE_STALE");

    // Different fingerprint: refused.
    let err = env
        .store
        .claim_session(ClaimSessionInput {
            token: claimed.admin_token.clone(),
            fingerprint: "stolen-laptop".to_string(),
            role: Role::Admin,
        })
        .await
        .expect_err("foreign device");
    assert_eq!(err.code(), "TOKEN_CLAIMED");
}

// =============================================================================
// Heartbeats & Risk
// =============================================================================

#[tokio::test]
async fn clean_heartbeats_keep_risk_at_zero() {
    let env = engine();
    let claimed = create_and_claim(&env).await;

    let out = env
        .store
        .handle_heartbeat(
            &claimed.student_signature,
            clean_heartbeat(),
            serde_json::json!({"focus": true}),
        )
        .await
        .expect("heartbeat");
    assert!(out.accepted);
    assert!(!out.locked);
    assert_eq!(out.risk_score, 0);
    assert_eq!(out.session_status, SessionStatus::InProgress);
    assert!(out.signature.is_none());
}

#[tokio::test]
async fn repeated_focus_loss_reaches_the_threshold_and_locks() {
    let env = engine();
    let claimed = create_and_claim(&env).await;

    // Focus loss contributes 3 per heartbeat; the fourth crosses 12.
    for expected in [3, 6, 9] {
        let out = env
            .store
            .handle_heartbeat(
                &claimed.student_signature,
                focus_lost_heartbeat(),
                serde_json::json!({"focus": false}),
            )
            .await
            .expect("heartbeat");
        assert!(!out.locked);
        assert_eq!(out.risk_score, expected);
    }

    let out = env
        .store
        .handle_heartbeat(
            &claimed.student_signature,
            focus_lost_heartbeat(),
            serde_json::json!({"focus": false}),
        )
        .await
        .expect("heartbeat");
    assert!(out.locked);
    assert_eq!(out.risk_score, 12);
    assert_eq!(out.session_status, SessionStatus::Locked);
    assert_eq!(out.lock_reason.as_deref(), Some("RISK_THRESHOLD"));
    assert!(env.sink.types().contains(&EventType::SessionLocked));
}

#[tokio::test]
async fn client_declared_risk_can_only_raise_the_score() {
    let env = engine();
    let claimed = create_and_claim(&env).await;

    // Declared above the computed score: adopted, and it locks.
    let out = env
        .store
        .handle_heartbeat(
            &claimed.student_signature,
            HeartbeatInput {
                signals: HeartbeatSignals::default(),
                risk_score: 50,
            },
            serde_json::json!({"riskScore": 50}),
        )
        .await
        .expect("heartbeat");
    assert_eq!(out.risk_score, 50);
    assert!(out.locked);
}

#[tokio::test]
async fn declared_risk_below_the_running_score_is_ignored() {
    let env = engine();
    let claimed = create_and_claim(&env).await;

    env.store
        .handle_heartbeat(
            &claimed.student_signature,
            focus_lost_heartbeat(),
            serde_json::json!({}),
        )
        .await
        .expect("heartbeat");

    // Declared 0 while the running score is 3; score must not drop.
    let out = env
        .store
        .handle_heartbeat(
            &claimed.student_signature,
            clean_heartbeat(),
            serde_json::json!({}),
        )
        .await
        .expect("heartbeat");
    assert_eq!(out.risk_score, 3);
}

#[tokio::test]
async fn locked_binding_heartbeats_get_a_lock_command() {
    let env = engine();
    let claimed = create_and_claim(&env).await;

    env.store
        .handle_heartbeat(
            &claimed.student_signature,
            HeartbeatInput {
                signals: HeartbeatSignals::default(),
                risk_score: 99,
            },
            serde_json::json!({}),
        )
        .await
        .expect("locking heartbeat");

    let out = env
        .store
        .handle_heartbeat(
            &claimed.student_signature,
            clean_heartbeat(),
            serde_json::json!({}),
        )
        .await
        .expect("post-lock heartbeat");
    assert!(!out.accepted);
    assert!(out.locked);
    assert_eq!(out.risk_score, 99);
}

// =============================================================================
// Signature Rotation & Authentication
// =============================================================================

#[tokio::test]
async fn heartbeat_near_expiry_rotates_the_signature() {
    let env = engine();
    let claimed = create_and_claim(&env).await;

    // TTL 300s, rotation margin 60s: at 250s in, 50s remain.
    env.clock.advance(Duration::seconds(250));

    let out = env
        .store
        .handle_heartbeat(
            &claimed.student_signature,
            clean_heartbeat(),
            serde_json::json!({}),
        )
        .await
        .expect("heartbeat");
    let fresh = out.signature.expect("rotated signature");
    assert_ne!(fresh, claimed.student_signature);

    // The old version is dead immediately.
    let err = env
        .store
        .authenticate(&claimed.student_signature)
        .await
        .expect_err("stale version");
    assert_eq!(err.code(), "SIGNATURE_STALE");

    // The fresh one authenticates.
    let auth = env.store.authenticate(&fresh).await.expect("fresh works");
    assert_eq!(auth.binding.signature_version, 2);
}

#[tokio::test]
async fn expired_signature_is_refused() {
    let env = engine();
    let claimed = create_and_claim(&env).await;

    env.clock.advance(Duration::seconds(301));

    let err = env
        .store
        .authenticate(&claimed.student_signature)
        .await
        .expect_err("expired");
    assert_eq!(err.code(), "SIGNATURE_EXPIRED");
    assert!(matches!(err, EngineError::Unauthorized { .. }));
}

#[tokio::test]
async fn garbage_signature_is_refused() {
    let env = engine();
    create_and_claim(&env).await;

    let err = env
        .store
        .authenticate("not-a-signature")
        .await
        .expect_err("invalid");
    assert_eq!(err.code(), "SIGNATURE_INVALID");
}

// =============================================================================
// Violation Reports
// =============================================================================

#[tokio::test]
async fn violation_severity_comes_from_the_fixed_table() {
    let env = engine();
    let claimed = create_and_claim(&env).await;

    let out = env
        .store
        .report_event(
            &claimed.student_signature,
            ReportEventInput {
                event_type: "overlay_detected".to_string(),
                severity: None,
                metadata: serde_json::json!({"app": "chat-helper"}),
            },
        )
        .await
        .expect("report");
    assert!(out.accepted);
    assert_eq!(out.risk_score, 5);
    assert!(!out.locked);
    assert!(out.violation_id.is_some());
}

#[tokio::test]
async fn unknown_violation_types_still_count() {
    let env = engine();
    let claimed = create_and_claim(&env).await;

    let out = env
        .store
        .report_event(
            &claimed.student_signature,
            ReportEventInput {
                event_type: "SOMETHING_NOVEL".to_string(),
                severity: None,
                metadata: serde_json::Value::Null,
            },
        )
        .await
        .expect("report");
    assert_eq!(out.risk_score, 1);
}

#[tokio::test]
async fn violations_lock_with_a_typed_reason() {
    let env = engine();
    let claimed = create_and_claim(&env).await;

    for _ in 0..2 {
        env.store
            .report_event(
                &claimed.student_signature,
                ReportEventInput {
                    event_type: "ACCESSIBILITY_ACTIVE".to_string(),
                    severity: None,
                    metadata: serde_json::Value::Null,
                },
            )
            .await
            .expect("report");
    }
    // 5 + 5 = 10; REPEATED_VIOLATION (6) crosses 12.
    let out = env
        .store
        .report_event(
            &claimed.student_signature,
            ReportEventInput {
                event_type: "REPEATED_VIOLATION".to_string(),
                severity: None,
                metadata: serde_json::Value::Null,
            },
        )
        .await
        .expect("report");
    assert!(out.locked);
    assert_eq!(out.risk_score, 16);
    assert_eq!(
        out.lock_reason.as_deref(),
        Some("VIOLATION:REPEATED_VIOLATION")
    );
    assert_eq!(out.session_status, SessionStatus::Locked);
}

// =============================================================================
// Proctor PIN
// =============================================================================

#[tokio::test]
async fn pin_set_before_claim_applies_to_later_students() {
    let env = engine();
    let created = env
        .store
        .create_session(CreateSessionInput {
            exam_name: "PIN flow".to_string(),
            created_by: "t".to_string(),
            token_count: 2,
            launch_url: None,
            token_ttl_minutes: None,
        })
        .await
        .expect("create");

    let admin = env
        .store
        .claim_session(ClaimSessionInput {
            token: created.admin_tokens[0].clone(),
            fingerprint: "proctor".to_string(),
            role: Role::Admin,
        })
        .await
        .expect("admin claim");

    env.store
        .set_proctor_pin(
            &admin.signature,
            SetProctorPinInput {
                pin: "4821".to_string(),
            },
        )
        .await
        .expect("set pin");

    // Student claims after the PIN was set and still receives it.
    let student = env
        .store
        .claim_session(ClaimSessionInput {
            token: created.student_tokens[0].clone(),
            fingerprint: "student".to_string(),
            role: Role::Student,
        })
        .await
        .expect("student claim");
    assert!(student.proctor_pin_set);

    let outcome = env
        .store
        .verify_proctor_pin(&student.signature, "4821")
        .await
        .expect("verify");
    assert_eq!(outcome, VerifyPinOutcome::Valid);

    let outcome = env
        .store
        .verify_proctor_pin(&student.signature, "0000")
        .await
        .expect("verify");
    assert_eq!(outcome, VerifyPinOutcome::PinInvalid);
}

#[tokio::test]
async fn pin_expires_at_the_end_of_its_calendar_day() {
    let env = engine();
    let claimed = create_and_claim(&env).await;

    env.store
        .set_proctor_pin(
            &claimed.admin_signature,
            SetProctorPinInput {
                pin: "112233".to_string(),
            },
        )
        .await
        .expect("set pin");

    // Still the same day.
    let outcome = env
        .store
        .verify_proctor_pin(&claimed.student_signature, "112233")
        .await
        .expect("verify");
    assert_eq!(outcome, VerifyPinOutcome::Valid);

    // Cross midnight. The signature would have expired, so reconnect first.
    env.clock.advance(Duration::hours(16));
    let fresh = env
        .store
        .reconnect_session(ReconnectInput {
            binding_id: claimed.student_binding.clone(),
            signature: Some(claimed.student_signature.clone()),
            token: None,
            fingerprint: None,
        })
        .await
        .expect("reconnect");

    let outcome = env
        .store
        .verify_proctor_pin(&fresh.signature, "112233")
        .await
        .expect("verify");
    assert_eq!(outcome, VerifyPinOutcome::PinExpired);
}

#[tokio::test]
async fn pin_checks_without_a_pin_report_not_set() {
    let env = engine();
    let claimed = create_and_claim(&env).await;

    let outcome = env
        .store
        .verify_proctor_pin(&claimed.student_signature, "1234")
        .await
        .expect("verify");
    assert_eq!(outcome, VerifyPinOutcome::PinNotSet);

    let status = env
        .store
        .proctor_pin_status(&claimed.student_signature)
        .await
        .expect("status");
    assert!(!status.set);
}

#[tokio::test]
async fn students_cannot_set_the_pin() {
    let env = engine();
    let claimed = create_and_claim(&env).await;

    let err = env
        .store
        .set_proctor_pin(
            &claimed.student_signature,
            SetProctorPinInput {
                pin: "9999".to_string(),
            },
        )
        .await
        .expect_err("forbidden");
    assert_eq!(err.code(), "ADMIN_REQUIRED");
    assert!(matches!(err, EngineError::Forbidden { .. }));
}

#[tokio::test]
async fn short_or_non_numeric_pins_are_rejected() {
    let env = engine();
    let claimed = create_and_claim(&env).await;

    for bad in ["123", "abcd", "12a4"] {
        let err = env
            .store
            .set_proctor_pin(
                &claimed.admin_signature,
                SetProctorPinInput {
                    pin: bad.to_string(),
                },
            )
            .await
            .expect_err("invalid pin");
        assert_eq!(err.code(), "PIN_INVALID_FORMAT");
    }
}

// =============================================================================
// Whitelist & Launch Config
// =============================================================================

#[tokio::test]
async fn launch_target_checks_follow_the_whitelist() {
    let env = engine();
    let claimed = create_and_claim(&env).await;

    // The forms.gle launch URL extends to the whole trusted family.
    assert!(env
        .store
        .check_launch_target(
            &claimed.student_signature,
            "https://docs.google.com/forms/d/e/xyz/viewform"
        )
        .await
        .expect("check"));
    // Default whitelist entry, subdomain suffix.
    assert!(env
        .store
        .check_launch_target(&claimed.student_signature, "https://portal.example.org/x")
        .await
        .expect("check"));
    assert!(!env
        .store
        .check_launch_target(&claimed.student_signature, "https://chat-helper.io")
        .await
        .expect("check"));
    // A host that merely extends a whitelisted entry textually is not it.
    assert!(!env
        .store
        .check_launch_target(
            &claimed.student_signature,
            "https://example.org.evil.com/steal"
        )
        .await
        .expect("check"));
}

#[tokio::test]
async fn admins_extend_the_whitelist_and_students_cannot() {
    let env = engine();
    let claimed = create_and_claim(&env).await;

    let urls = env
        .store
        .add_whitelist_url(&claimed.admin_signature, "library.school.edu")
        .await
        .expect("add");
    assert!(urls.contains(&"https://library.school.edu".to_string()));
    assert!(env
        .store
        .check_launch_target(&claimed.student_signature, "https://library.school.edu/ref")
        .await
        .expect("check"));

    let err = env
        .store
        .add_whitelist_url(&claimed.student_signature, "https://evil.com")
        .await
        .expect_err("forbidden");
    assert_eq!(err.code(), "ADMIN_REQUIRED");
}

#[tokio::test]
async fn updating_the_launch_url_auto_whitelists_it() {
    let env = engine();
    let claimed = create_and_claim(&env).await;

    let config = env
        .store
        .update_launch_url(&claimed.admin_signature, "exam.school.edu/start")
        .await
        .expect("update");
    assert_eq!(
        config.launch_url.as_deref(),
        Some("https://exam.school.edu/start")
    );
    assert_eq!(config.provider.as_deref(), Some("web"));
    assert!(config
        .whitelist
        .contains(&"https://exam.school.edu/start".to_string()));

    let fetched = env
        .store
        .get_launch_config(&claimed.student_signature)
        .await
        .expect("get");
    assert_eq!(fetched.launch_url, config.launch_url);
}

// =============================================================================
// Admin Control: Finish, Revoke, Pause, Reissue
// =============================================================================

#[tokio::test]
async fn finishing_a_session_locks_every_binding() {
    let env = engine();
    let claimed = create_and_claim(&env).await;

    let out = env
        .store
        .finish_session(&claimed.admin_signature)
        .await
        .expect("finish");
    assert_eq!(out.session.status, SessionStatus::Finished);
    assert!(out.session.end_time.is_some());
    assert_eq!(out.bindings_locked, 2);

    // Students heartbeating after the end get the lock command.
    let hb = env
        .store
        .handle_heartbeat(
            &claimed.student_signature,
            clean_heartbeat(),
            serde_json::json!({}),
        )
        .await
        .expect("heartbeat");
    assert!(!hb.accepted);
    assert!(hb.locked);
    assert_eq!(hb.lock_reason.as_deref(), Some("SESSION_FINISHED"));

    // And the session cannot be finished twice.
    let err = env
        .store
        .finish_session(&claimed.admin_signature)
        .await
        .expect_err("already ended");
    assert_eq!(err.code(), "SESSION_ENDED");
}

#[tokio::test]
async fn revoking_a_session_locks_bindings_with_a_revoke_reason() {
    let env = engine();
    let claimed = create_and_claim(&env).await;

    let out = env
        .store
        .revoke_session(&claimed.admin_signature)
        .await
        .expect("revoke");
    assert_eq!(out.session.status, SessionStatus::Revoked);
    assert_eq!(out.bindings_locked, 2);

    let hb = env
        .store
        .handle_heartbeat(
            &claimed.student_signature,
            clean_heartbeat(),
            serde_json::json!({}),
        )
        .await
        .expect("heartbeat");
    assert!(!hb.accepted);
    assert_eq!(hb.lock_reason.as_deref(), Some("SESSION_REVOKED"));
}

#[tokio::test]
async fn revoking_one_student_leaves_the_session_running() {
    let env = engine();
    let claimed = create_and_claim(&env).await;

    env.store
        .revoke_student_token(&claimed.admin_signature, &claimed.student_token)
        .await
        .expect("revoke token");

    let hb = env
        .store
        .handle_heartbeat(
            &claimed.student_signature,
            clean_heartbeat(),
            serde_json::json!({}),
        )
        .await
        .expect("heartbeat");
    assert!(!hb.accepted);
    assert_eq!(hb.lock_reason.as_deref(), Some("STUDENT_REVOKED"));

    // The session itself keeps running for everyone else.
    let monitor = env
        .store
        .monitor(&claimed.admin_signature)
        .await
        .expect("monitor");
    assert_eq!(monitor.session.status, SessionStatus::InProgress);
}

#[tokio::test]
async fn paused_sessions_record_heartbeats_without_tier_changes() {
    let env = engine();
    let claimed = create_and_claim(&env).await;

    let session = env
        .store
        .pause_session(&claimed.admin_signature)
        .await
        .expect("pause");
    assert_eq!(session.status, SessionStatus::Paused);

    // Heartbeats still land and still accumulate risk, but the status
    // stays PAUSED.
    let hb = env
        .store
        .handle_heartbeat(
            &claimed.student_signature,
            focus_lost_heartbeat(),
            serde_json::json!({}),
        )
        .await
        .expect("heartbeat");
    assert!(hb.accepted);
    assert_eq!(hb.risk_score, 3);
    assert_eq!(hb.session_status, SessionStatus::Paused);

    let session = env
        .store
        .resume_session(&claimed.admin_signature)
        .await
        .expect("resume");
    assert_eq!(session.status, SessionStatus::InProgress);
}

#[tokio::test]
async fn reissue_recovers_a_risk_locked_student() {
    let env = engine();
    let claimed = create_and_claim(&env).await;

    env.store
        .handle_heartbeat(
            &claimed.student_signature,
            HeartbeatInput {
                signals: HeartbeatSignals::default(),
                risk_score: 40,
            },
            serde_json::json!({}),
        )
        .await
        .expect("locking heartbeat");

    let out = env
        .store
        .reissue_student_signature(&claimed.admin_signature, &claimed.student_binding)
        .await
        .expect("reissue");
    assert_eq!(out.session_status, SessionStatus::InProgress);

    let auth = env.store.authenticate(&out.signature).await.expect("auth");
    assert!(!auth.binding.locked);
    // Risk history survives recovery.
    assert_eq!(auth.binding.risk_score, 40);

    // The pre-lock signature stays dead.
    let err = env
        .store
        .authenticate(&claimed.student_signature)
        .await
        .expect_err("old signature");
    assert_eq!(err.code(), "SIGNATURE_STALE");
}

#[tokio::test]
async fn reissue_never_resurrects_a_finished_session() {
    let env = engine();
    let claimed = create_and_claim(&env).await;

    env.store
        .finish_session(&claimed.admin_signature)
        .await
        .expect("finish");

    let err = env
        .store
        .reissue_student_signature(&claimed.admin_signature, &claimed.student_binding)
        .await
        .expect_err("finished stays finished");
    assert_eq!(err.code(), "SESSION_ENDED");
}

// =============================================================================
// Reconnect
// =============================================================================

#[tokio::test]
async fn reconnect_accepts_an_expired_but_genuine_signature() {
    let env = engine();
    let claimed = create_and_claim(&env).await;

    env.clock.advance(Duration::seconds(400));

    let out = env
        .store
        .reconnect_session(ReconnectInput {
            binding_id: claimed.student_binding.clone(),
            signature: Some(claimed.student_signature.clone()),
            token: None,
            fingerprint: None,
        })
        .await
        .expect("reconnect");
    env.store
        .authenticate(&out.signature)
        .await
        .expect("fresh signature works");
}

#[tokio::test]
async fn reconnect_accepts_the_claim_fingerprint() {
    let env = engine();
    let claimed = create_and_claim(&env).await;

    env.clock.advance(Duration::seconds(400));

    let out = env
        .store
        .reconnect_session(ReconnectInput {
            binding_id: claimed.student_binding.clone(),
            signature: None,
            token: None,
            fingerprint: Some("student-device-1".to_string()),
        })
        .await
        .expect("reconnect");
    assert_eq!(out.session.status, SessionStatus::InProgress);
}

#[tokio::test]
async fn reconnect_rejects_wrong_proof() {
    let env = engine();
    let claimed = create_and_claim(&env).await;

    let err = env
        .store
        .reconnect_session(ReconnectInput {
            binding_id: claimed.student_binding.clone(),
            signature: None,
            token: Some("S-WRONGTOKEN".to_string()),
            fingerprint: None,
        })
        .await
        .expect_err("wrong token");
    assert_eq!(err.code(), "RECONNECT_PROOF_INVALID");

    let err = env
        .store
        .reconnect_session(ReconnectInput {
            binding_id: claimed.student_binding.clone(),
            signature: None,
            token: None,
            fingerprint: Some("someone-elses-device".to_string()),
        })
        .await
        .expect_err("wrong fingerprint");
    assert_eq!(err.code(), "RECONNECT_PROOF_INVALID");
}

#[tokio::test]
async fn reconnect_refuses_risk_locked_bindings() {
    let env = engine();
    let claimed = create_and_claim(&env).await;

    env.store
        .handle_heartbeat(
            &claimed.student_signature,
            HeartbeatInput {
                signals: HeartbeatSignals::default(),
                risk_score: 40,
            },
            serde_json::json!({}),
        )
        .await
        .expect("locking heartbeat");

    let err = env
        .store
        .reconnect_session(ReconnectInput {
            binding_id: claimed.student_binding.clone(),
            signature: Some(claimed.student_signature.clone()),
            token: None,
            fingerprint: None,
        })
        .await
        .expect_err("risk locks need an admin");
    assert_eq!(err.code(), "BINDING_LOCKED");
    assert!(matches!(err, EngineError::Forbidden { .. }));
}

// =============================================================================
// Monitor
// =============================================================================

#[tokio::test]
async fn monitor_reports_live_token_statuses() {
    let env = engine();
    let created = env
        .store
        .create_session(CreateSessionInput {
            exam_name: "Monitor".to_string(),
            created_by: "t".to_string(),
            token_count: 3,
            launch_url: None,
            token_ttl_minutes: None,
        })
        .await
        .expect("create");

    let admin = env
        .store
        .claim_session(ClaimSessionInput {
            token: created.admin_tokens[0].clone(),
            fingerprint: "proctor".to_string(),
            role: Role::Admin,
        })
        .await
        .expect("admin claim");
    let student = env
        .store
        .claim_session(ClaimSessionInput {
            token: created.student_tokens[0].clone(),
            fingerprint: "student".to_string(),
            role: Role::Student,
        })
        .await
        .expect("student claim");

    // The claimed student goes silent past the heartbeat timeout; the
    // admin stays current by reconnect-free recency (claim counts).
    env.clock.advance(Duration::seconds(45));
    env.store
        .handle_heartbeat(&admin.signature, clean_heartbeat(), serde_json::json!({}))
        .await
        .expect("admin heartbeat");

    let monitor = env.store.monitor(&admin.signature).await.expect("monitor");
    assert_eq!(monitor.tokens.len(), 3);

    let by_token = |t: &str| {
        monitor
            .tokens
            .iter()
            .find(|m| m.token == t)
            .expect("token present")
    };
    assert_eq!(
        by_token(&created.student_tokens[0]).status.as_str(),
        "offline"
    );
    assert_eq!(
        by_token(&created.student_tokens[1]).status.as_str(),
        "issued"
    );
    assert_eq!(by_token(&created.admin_tokens[0]).status.as_str(), "online");
    assert_eq!(
        by_token(&created.student_tokens[0]).binding_id.as_deref(),
        Some(student.binding_id.as_str())
    );

    // Students cannot read the monitor.
    let err = env
        .store
        .monitor(&student.signature)
        .await
        .expect_err("forbidden");
    assert_eq!(err.code(), "ADMIN_REQUIRED");
}

#[tokio::test]
async fn monitor_reports_claimed_tokens_past_their_expiry_as_expired() {
    let env = engine();
    let created = env
        .store
        .create_session(CreateSessionInput {
            exam_name: "Short TTL".to_string(),
            created_by: "t".to_string(),
            token_count: 2,
            launch_url: None,
            token_ttl_minutes: Some(30),
        })
        .await
        .expect("create");

    let admin = env
        .store
        .claim_session(ClaimSessionInput {
            token: created.admin_tokens[0].clone(),
            fingerprint: "proctor".to_string(),
            role: Role::Admin,
        })
        .await
        .expect("admin claim");
    env.store
        .claim_session(ClaimSessionInput {
            token: created.student_tokens[0].clone(),
            fingerprint: "student".to_string(),
            role: Role::Student,
        })
        .await
        .expect("student claim");

    // Past the token TTL every signature has lapsed too; the proctor
    // device reconnects on its fingerprint.
    env.clock.advance(Duration::minutes(31));
    let fresh = env
        .store
        .reconnect_session(ReconnectInput {
            binding_id: admin.binding_id.clone(),
            signature: None,
            token: None,
            fingerprint: Some("proctor".to_string()),
        })
        .await
        .expect("admin reconnect");

    let monitor = env.store.monitor(&fresh.signature).await.expect("monitor");
    let student_row = monitor
        .tokens
        .iter()
        .find(|m| m.token == created.student_tokens[0])
        .expect("token present");
    // Claimed, bound, and yet expired: expiry outranks liveness.
    assert_eq!(student_row.status.as_str(), "expired");
    assert!(student_row.binding_id.is_some());
}

// =============================================================================
// Broadcast Ordering
// =============================================================================

#[tokio::test]
async fn events_publish_only_after_successful_commits() {
    let env = engine();
    let claimed = create_and_claim(&env).await;

    // A failing mutation must not leak its events.
    let before = env.sink.events().len();
    let _ = env
        .store
        .add_whitelist_url(&claimed.student_signature, "https://x.org")
        .await
        .expect_err("forbidden");
    assert_eq!(env.sink.events().len(), before);

    let types = env.sink.types();
    assert_eq!(types[0], EventType::SessionCreated);
    assert!(types.contains(&EventType::SessionClaimed));
}
