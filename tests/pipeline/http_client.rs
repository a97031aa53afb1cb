use std::time::Duration;

use crate::support::helpers::{fast_config, init_tracing, Harness, MemorySource};
use crate::support::mock_service::{MockAccount, MockAccountService, MockAccounts};
use anyhow::Result;
use nodesweep::{
    Account, AccountService, AccountServiceFactory, ErrorKind, HttpAccountServiceFactory,
    HttpServiceOptions, PassEnd,
};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn http_service_walks_the_node_endpoints() -> Result<()> {
    init_tracing();
    let accounts = MockAccounts::default();
    accounts.insert(
        "0xabc",
        MockAccount {
            running: true,
            points: 1250,
            proof: Some("proof-abc".into()),
            ..MockAccount::default()
        },
    );
    let server = MockAccountService::start(accounts.clone()).await?;

    let factory = HttpAccountServiceFactory::new(server.url())?;
    let mut service = factory.connect(&Account::new("0xabc", "secret-key"), None)?;

    service.check_in().await?;
    assert!(service.node_running().await?);
    service.stop_node().await?;
    assert!(!accounts.account("0xabc").unwrap().running);
    service.connect_node().await?;
    let points = service.node_points().await?;
    assert_eq!(points.points, 1250);
    assert_eq!(points.referral_code.as_deref(), Some("MOCK"));
    assert_eq!(points.referral_count, 3);
    assert_eq!(service.fetch_proof().await?.as_deref(), Some("proof-abc"));
    service.close().await;

    assert_eq!(
        accounts.paths_for("0xabc"),
        vec!["/check-in", "/node", "/node/stop", "/node/start", "/points", "/proof"]
    );
    assert!(accounts
        .requests()
        .iter()
        .all(|req| req.authorization.as_deref() == Some("Bearer secret-key")));

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn http_error_status_surfaces_with_step() -> Result<()> {
    init_tracing();
    let accounts = MockAccounts::default();
    accounts.insert(
        "0xdead",
        MockAccount {
            fail_points: true,
            ..MockAccount::default()
        },
    );
    let server = MockAccountService::start(accounts).await?;

    let factory = HttpAccountServiceFactory::new(server.url())?;
    let mut service = factory.connect(&Account::new("0xdead", "k"), None)?;
    let err = service.node_points().await.expect_err("500 must fail");
    let message = format!("{err:#}");
    assert!(message.contains("query points"), "unexpected error: {message}");
    assert!(message.contains("500"), "unexpected error: {message}");
    assert_eq!(ErrorKind::classify(&message), ErrorKind::Error);

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_service_reports_a_timeout() -> Result<()> {
    init_tracing();
    let accounts = MockAccounts::default();
    accounts.insert(
        "0xslow",
        MockAccount {
            check_in_delay: Some(Duration::from_millis(800)),
            ..MockAccount::default()
        },
    );
    let server = MockAccountService::start(accounts).await?;

    let options = HttpServiceOptions {
        request_timeout: Duration::from_millis(150),
        ..HttpServiceOptions::default()
    };
    let factory = HttpAccountServiceFactory::with_options(server.url(), options)?;
    let mut service = factory.connect(&Account::new("0xslow", "k"), None)?;
    let err = service.check_in().await.expect_err("check-in should time out");
    assert_eq!(ErrorKind::classify(&format!("{err:#}")), ErrorKind::Timeout);

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pass_against_http_service_stores_proofs() -> Result<()> {
    init_tracing();
    let accounts = MockAccounts::default();
    for (address, proof) in [("0x01", "p-1"), ("0x02", "p-2"), ("0x03", "p-3")] {
        accounts.insert(
            address,
            MockAccount {
                running: address == "0x02",
                points: 10,
                proof: Some(proof.into()),
                ..MockAccount::default()
            },
        );
    }
    let server = MockAccountService::start(accounts.clone()).await?;

    let source = MemorySource::new(vec![
        Account::new("0x01", "k1"),
        Account::new("0x02", "k2").with_proof("kept"),
        Account::new("0x03", "k3"),
        Account::new("0x04", "k4"),
    ]);
    let factory = HttpAccountServiceFactory::new(server.url())?;
    let harness = Harness::start(fast_config(2), source, factory, &[]).await?;

    let summary = harness.scheduler.run_pass(1).await;

    assert_eq!(summary.end, PassEnd::Drained);
    assert_eq!(summary.processed, 4);
    assert_eq!(summary.errors, 1, "0x04 is unknown to the service");
    assert_eq!(harness.source.proof_of("0x01").as_deref(), Some("p-1"));
    assert_eq!(harness.source.proof_of("0x02").as_deref(), Some("kept"));
    assert_eq!(harness.source.proof_of("0x03").as_deref(), Some("p-3"));
    assert!(accounts.paths_for("0x02").contains(&"/node/stop".to_string()));
    assert!(!accounts.paths_for("0x02").contains(&"/proof".to_string()));

    harness.stop().await;
    server.shutdown().await;
    Ok(())
}
