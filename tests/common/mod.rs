// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! Shared test harness: a store over the bundled storage engine with a
//! manual clock and a recording event sink.

// Not every test binary touches every helper.
#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use std::sync::Arc;

use examgate::broadcast::MemorySink;
use examgate::clock::ManualClock;
use examgate::config::EngineConfig;
use examgate::db::MemoryDb;
use examgate::model::Role;
use examgate::store::{ClaimSessionInput, CreateSessionInput, SessionStore};

pub struct TestEngine {
    pub store: SessionStore,
    pub db: MemoryDb,
    pub clock: Arc<ManualClock>,
    pub sink: Arc<MemorySink>,
}

pub fn engine() -> TestEngine {
    engine_with(EngineConfig::default())
}

pub fn engine_with(config: EngineConfig) -> TestEngine {
    // A fixed Monday morning; PIN day-validity tests advance past midnight.
    let start = Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 0).unwrap();
    let db = MemoryDb::new();
    let clock = Arc::new(ManualClock::new(start));
    let sink = Arc::new(MemorySink::new());
    let store = SessionStore::new(
        Arc::new(db.clone()),
        config,
        clock.clone(),
        sink.clone(),
    );
    TestEngine {
        store,
        db,
        clock,
        sink,
    }
}

/// One session with a claimed student and a claimed admin device.
pub struct ClaimedSession {
    pub session_id: String,
    pub student_token: String,
    pub student_binding: String,
    pub student_signature: String,
    pub admin_token: String,
    pub admin_binding: String,
    pub admin_signature: String,
}

pub async fn create_and_claim(engine: &TestEngine) -> ClaimedSession {
    let created = engine
        .store
        .create_session(CreateSessionInput {
            exam_name: "Algebra Midterm".to_string(),
            created_by: "ms-hart".to_string(),
            token_count: 2,
            launch_url: Some("https://forms.gle/exam123".to_string()),
            token_ttl_minutes: None,
        })
        .await
        .expect("create session");

    let student_token = created.student_tokens[0].clone();
    let admin_token = created.admin_tokens[0].clone();

    let student = engine
        .store
        .claim_session(ClaimSessionInput {
            token: student_token.clone(),
            fingerprint: "student-device-1".to_string(),
            role: Role::Student,
        })
        .await
        .expect("student claim");

    let admin = engine
        .store
        .claim_session(ClaimSessionInput {
            token: admin_token.clone(),
            fingerprint: "proctor-tablet-1".to_string(),
            role: Role::Admin,
        })
        .await
        .expect("admin claim");

    ClaimedSession {
        session_id: created.session.id,
        student_token,
        student_binding: student.binding_id,
        student_signature: student.signature,
        admin_token,
        admin_binding: admin.binding_id,
        admin_signature: admin.signature,
    }
}
