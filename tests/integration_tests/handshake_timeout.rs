// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use rsc_client_rs::{
    client::{RpcError, rpc::Rpc},
    session::{SessionState, interactive::InteractiveSession},
};
use tokio::time::Instant;

use crate::integration_tests::common::{
    DriverScript, await_state, spawn_driver, test_config,
};

#[tokio::test]
async fn a_mute_peer_fails_the_connect_within_the_handshake_timeout() -> Result<()> {
    let (addr, _counters) = spawn_driver(DriverScript::SilentSasl).await?;
    let mut cfg = test_config(&addr)?;
    cfg.rpc.handshake_timeout = Duration::from_millis(300);

    let start = Instant::now();
    let err = Rpc::connect(&cfg)
        .await
        .err()
        .expect("connect must fail against a mute peer");
    assert!(matches!(
        err.downcast_ref::<RpcError>(),
        Some(RpcError::HandshakeTimeout(_))
    ));
    assert!(start.elapsed() < Duration::from_secs(3));
    Ok(())
}

#[tokio::test]
async fn a_session_facing_a_mute_peer_dies_without_ever_running() -> Result<()> {
    let (addr, _counters) = spawn_driver(DriverScript::SilentSasl).await?;
    let mut cfg = test_config(&addr)?;
    cfg.rpc.handshake_timeout = Duration::from_millis(300);

    let session = InteractiveSession::create(0, cfg);
    assert_eq!(session.state(), SessionState::Starting);
    assert!(await_state(&session, SessionState::Dead, Duration::from_secs(5)).await);
    Ok(())
}
