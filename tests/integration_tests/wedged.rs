// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use rsc_client_rs::session::{
    SessionError, SessionState, interactive::InteractiveSession, statement::Outcome,
};

use crate::integration_tests::common::{
    DriverScript, await_state, spawn_driver, test_config,
};

#[tokio::test]
async fn wedged_interpreter_poisons_the_session() -> Result<()> {
    let (addr, _counters) = spawn_driver(DriverScript::Wedged).await?;
    let session = InteractiveSession::create(0, test_config(&addr)?);
    assert!(await_state(&session, SessionState::Idle, Duration::from_secs(5)).await);

    let stmt = session.execute_statement("undefined_name").await?;
    let outcome = stmt.result.wait().await;
    let Outcome::Value(doc) = outcome else {
        panic!("expected an error document, got {outcome:?}");
    };
    assert_eq!(doc["status"], "error");

    // The driver reported a globally wedged interpreter.
    assert_eq!(session.state(), SessionState::Error);

    let err = session
        .execute_statement("1 + 2")
        .await
        .expect_err("a poisoned session must refuse work");
    assert!(matches!(
        err.downcast_ref::<SessionError>(),
        Some(SessionError::NotRunning { .. })
    ));

    session.stop().await?;
    assert_eq!(session.state(), SessionState::Dead);
    Ok(())
}
