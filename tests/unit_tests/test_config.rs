// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use anyhow::Result;
use rsc_client_rs::cfg::{
    config::{Config, PASSTHROUGH_ENV, driver_conf, driver_env},
    enums::{Qop, SessionKind},
};
use serial_test::serial;

use crate::unit_tests::load_config;

#[test]
fn fixture_loads_and_validates() -> Result<()> {
    let cfg = load_config()?;

    assert_eq!(cfg.rpc.driver_address, "127.0.0.1:10715");
    assert_eq!(cfg.rpc.connect_timeout, Duration::from_millis(5000));
    assert_eq!(cfg.rpc.handshake_timeout, Duration::from_millis(10000));
    assert_eq!(cfg.rpc.max_message_size, 1048576);
    assert_eq!(cfg.rpc.channel_log_level, "debug");
    assert_eq!(cfg.rpc.sasl_mechanisms, vec!["DIGEST-MD5".to_string()]);
    assert_eq!(cfg.rpc.sasl_qop, Qop::AuthInt);

    assert_eq!(cfg.client.client_id, "test-client");
    assert_eq!(cfg.session.kind, SessionKind::Spark);
    assert_eq!(cfg.session.owner, "tester");
    assert_eq!(cfg.session.proxy_user, None);
    assert_eq!(cfg.repl.jars_path, "/opt/repl/jars");
    Ok(())
}

#[test]
fn validation_catches_bad_configs() -> Result<()> {
    let base = load_config()?;

    let mut cfg = base.clone();
    cfg.client.client_id.clear();
    assert!(cfg.validate().is_err());

    let mut cfg = base.clone();
    cfg.client.secret.clear();
    assert!(cfg.validate().is_err());

    let mut cfg = base.clone();
    cfg.rpc.sasl_mechanisms = vec!["PLAIN".to_string()];
    assert!(cfg.validate().is_err());

    let mut cfg = base.clone();
    cfg.rpc.max_message_size = 16;
    assert!(cfg.validate().is_err());

    let mut cfg = base;
    cfg.rpc.handshake_timeout = Duration::ZERO;
    assert!(cfg.validate().is_err());
    Ok(())
}

#[test]
fn session_kind_accepts_common_spellings() -> Result<()> {
    for (raw, want) in [
        ("spark", SessionKind::Spark),
        ("Spark", SessionKind::Spark),
        ("pyspark", SessionKind::PySpark),
        ("PySpark", SessionKind::PySpark),
        ("sparkr", SessionKind::SparkR),
        ("SparkR", SessionKind::SparkR),
    ] {
        let got: SessionKind = serde_yaml::from_str(raw)?;
        assert_eq!(got, want);
    }
    assert_eq!(SessionKind::PySpark.to_string(), "pyspark");
    Ok(())
}

#[test]
fn driver_conf_is_canonical_and_never_leaks_the_secret() -> Result<()> {
    let mut cfg = load_config()?;
    cfg.session.proxy_user = Some("alice".to_string());

    let blob = driver_conf(&cfg);
    let text = String::from_utf8(blob.clone())?;
    assert!(!text.contains("test-secret"));

    let pairs: Vec<&str> = text.split_terminator('\0').collect();
    assert_eq!(
        pairs,
        vec![
            "client.id=test-client",
            "proxy.user=alice",
            "repl.driver-classpath=/opt/repl/extra",
            "repl.jars=/opt/repl/jars",
            "session.kind=spark",
            "session.owner=tester",
        ]
    );

    // Same config, same bytes.
    assert_eq!(blob, driver_conf(&cfg));

    // Unset optionals simply vanish.
    cfg.session.proxy_user = None;
    cfg.repl.jars_path.clear();
    let text = String::from_utf8(driver_conf(&cfg))?;
    assert!(!text.contains("proxy.user"));
    assert!(!text.contains("repl.jars="));
    Ok(())
}

#[test]
#[serial]
fn driver_env_forwards_only_the_documented_variables() {
    // SAFETY: guarded by #[serial]; no other test touches the environment.
    unsafe {
        std::env::set_var("LIVY_REPL_JAVA_OPTS", "-Xmx1g");
        std::env::remove_var("PYSPARK_ARCHIVES_PATH");
    }

    let env = driver_env();
    assert!(
        env.iter()
            .any(|(k, v)| k == "LIVY_REPL_JAVA_OPTS" && v == "-Xmx1g")
    );
    assert!(env.iter().all(|(k, _)| PASSTHROUGH_ENV.contains(&k.as_str())));

    unsafe {
        std::env::remove_var("LIVY_REPL_JAVA_OPTS");
    }
}
