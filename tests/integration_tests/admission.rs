// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::atomic::Ordering;

use anyhow::Result;
use rsc_client_rs::session::{
    SessionError, SessionState, interactive::InteractiveSession,
};

use crate::integration_tests::common::{DriverScript, spawn_driver, test_config};

#[tokio::test]
async fn operations_are_refused_before_the_session_is_ready() -> Result<()> {
    // The driver never answers SASL, so the session stays in Starting.
    let (addr, counters) = spawn_driver(DriverScript::SilentSasl).await?;
    let session = InteractiveSession::create(0, test_config(&addr)?);
    assert_eq!(session.state(), SessionState::Starting);

    let err = session
        .execute_statement("1 + 2")
        .await
        .expect_err("a starting session must refuse statements");
    assert!(matches!(
        err.downcast_ref::<SessionError>(),
        Some(SessionError::NotRunning {
            state: SessionState::Starting,
            ..
        })
    ));

    // No side effects: no statement allocated, nothing reached the wire.
    assert_eq!(session.statement_count().await, 0);
    assert_eq!(session.state(), SessionState::Starting);
    assert_eq!(counters.repl_codes.load(Ordering::SeqCst), 0);

    let err = session
        .run_job(vec![1, 2, 3])
        .await
        .expect_err("a starting session must refuse jobs");
    assert!(matches!(
        err.downcast_ref::<SessionError>(),
        Some(SessionError::NotRunning { .. })
    ));

    Ok(())
}
