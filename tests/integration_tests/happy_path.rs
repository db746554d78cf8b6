// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::atomic::Ordering, time::Duration};

use anyhow::Result;
use rsc_client_rs::session::{
    SessionState, manager::SessionManager, statement::Outcome,
};

use crate::integration_tests::common::{
    DriverScript, await_state, spawn_driver, test_config,
};

#[tokio::test]
async fn statement_lifecycle_end_to_end() -> Result<()> {
    let (addr, counters) = spawn_driver(DriverScript::Normal).await?;
    let cfg = test_config(&addr)?;

    let manager = SessionManager::new();
    let session = manager.create_session(&cfg);
    assert_eq!(session.state(), SessionState::Starting);
    assert!(await_state(&session, SessionState::Idle, Duration::from_secs(5)).await);

    // Submission flips the session to Busy synchronously; the first poll
    // returns null so it stays Busy for at least one backoff interval.
    let stmt = session.execute_statement("1 + 2").await?;
    assert_eq!(stmt.id, 0);
    assert_eq!(session.state(), SessionState::Busy);

    let outcome = stmt.result.wait().await;
    let Outcome::Value(doc) = outcome else {
        panic!("expected a value, got {outcome:?}");
    };
    assert_eq!(doc["status"], "ok");
    assert_eq!(doc["output"], "3");
    assert_eq!(session.state(), SessionState::Idle);

    // Same code again: a distinct statement with the next dense id.
    let stmt2 = session.execute_statement("1 + 2").await?;
    assert_eq!(stmt2.id, 1);
    let outcome = stmt2.result.wait().await;
    assert!(matches!(outcome, Outcome::Value(_)));
    assert_eq!(session.statement_count().await, 2);
    assert_eq!(counters.repl_codes.load(Ordering::SeqCst), 2);

    session.add_jar("file:///tmp/udf.jar").await?;
    session.add_file("file:///tmp/data.csv").await?;
    assert_eq!(counters.resources.load(Ordering::SeqCst), 2);

    manager.stop_session(session.id).await?;
    assert_eq!(session.state(), SessionState::Dead);
    assert_eq!(manager.active(), 0);
    Ok(())
}
