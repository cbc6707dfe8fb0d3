use chrono::Duration;
use library_payments::{
    clock::{Clock, ManualClock},
    config::GatewayConfig,
    error::GatewayError,
    payments::{GatewayClient, PaymentGateway, SavedCardCharge},
};
use serde_json::json;
use std::sync::Arc;
use wiremock::{
    matchers::{body_string_contains, header, method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

fn config(server: &MockServer) -> GatewayConfig {
    GatewayConfig {
        client_id: "library".to_string(),
        client_secret: "s3cret".to_string(),
        terminal_id: "67e34d63-102f-4bd1-898e-370781d0074d".to_string(),
        oauth_url: Some(format!("{}/oauth2/token", server.uri())),
        api_url: Some(format!("{}/", server.uri())),
        post_link: "https://library.example/api/payments/callback".to_string(),
        request_timeout_secs: 5,
        ..Default::default()
    }
}

async fn mount_token(server: &MockServer, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .and(body_string_contains("grant_type=client_credentials"))
        .and(body_string_contains("client_id=library"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "bearer-abc",
            "expires_in": "7200",
            "token_type": "Bearer"
        })))
        .expect(expected_calls)
        .mount(server)
        .await;
}

fn client(server: &MockServer) -> anyhow::Result<(GatewayClient, Arc<ManualClock>)> {
    let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
    Ok((GatewayClient::new(config(server), clock.clone())?, clock))
}

#[tokio::test]
async fn test_token_is_cached_until_refresh_buffer() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_token(&server, 2).await;
    let (client, clock) = client(&server)?;

    for _ in 0..5 {
        assert_eq!(client.get_token().await?, "bearer-abc");
    }
    let cached = client.token_cache().current().await.unwrap();
    assert_eq!(cached.expires_at, clock.now() + Duration::seconds(7200));

    // Inside the five minute buffer: refetch.
    clock.advance(Duration::seconds(7200 - 299));
    client.get_token().await?;

    server.verify().await;
    Ok(())
}

#[tokio::test]
async fn test_unusable_token_lifetime_is_rejected() -> anyhow::Result<()> {
    for expires_in in [json!("0"), json!(-30), json!("9223372036854775807")] {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "bearer-abc",
                "expires_in": expires_in,
                "token_type": "Bearer"
            })))
            .mount(&server)
            .await;
        let (client, _clock) = client(&server)?;

        let err = client.get_token().await.unwrap_err();
        assert!(matches!(err, GatewayError::InvalidResponse(_)), "{:?}", err);
        assert!(!err.is_retryable());
        assert!(client.token_cache().current().await.is_none());
    }
    Ok(())
}

#[tokio::test]
async fn test_concurrent_callers_share_one_grant() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_token(&server, 1).await;
    let (client, _clock) = client(&server)?;
    let client = Arc::new(client);

    let mut handles = Vec::new();
    for _ in 0..10 {
        let client = client.clone();
        handles.push(tokio::spawn(async move { client.get_token().await }));
    }
    for handle in handles {
        assert_eq!(handle.await??, "bearer-abc");
    }

    server.verify().await;
    Ok(())
}

#[tokio::test]
async fn test_check_status_maps_transaction() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_token(&server, 1).await;
    Mock::given(method("GET"))
        .and(path("/check-status/payment/transaction/000000000042"))
        .and(header("authorization", "Bearer bearer-abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resultCode": "100",
            "resultMessage": "SUCCESS",
            "transaction": {
                "id": "txn-42",
                "invoiceID": "000000000042",
                "amount": 5000,
                "currency": "KZT",
                "cardMask": "440043...0128",
                "approvalCode": 512394,
                "reference": 123456789012u64,
                "reason": "success",
                "reasonCode": 0,
                "statusName": "CHARGE"
            }
        })))
        .mount(&server)
        .await;
    let (client, _clock) = client(&server)?;

    let status = client.check_status("000000000042").await?;
    assert_eq!(status.status, "CHARGE");
    assert_eq!(status.transaction_id.as_deref(), Some("txn-42"));
    assert_eq!(status.amount, Some(5000));
    assert_eq!(status.approval_code.as_deref(), Some("512394"));
    assert_eq!(status.reference.as_deref(), Some("123456789012"));
    Ok(())
}

#[tokio::test]
async fn test_check_status_unknown_invoice_is_rejected() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_token(&server, 1).await;
    Mock::given(method("GET"))
        .and(path("/check-status/payment/transaction/000000000404"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "resultCode": "103",
            "resultMessage": "Transaction not found"
        })))
        .mount(&server)
        .await;
    let (client, _clock) = client(&server)?;

    let err = client.check_status("000000000404").await.unwrap_err();
    match err {
        GatewayError::Rejected { code, message, .. } => {
            assert_eq!(code, "103");
            assert_eq!(message, "Transaction not found");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_refund_sends_query_parameters() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_token(&server, 1).await;
    Mock::given(method("POST"))
        .and(path("/operation/txn-42/refund"))
        .and(query_param("amount", "2000"))
        .and(query_param("externalID", "refund-1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    let (client, _clock) = client(&server)?;

    client.refund("txn-42", Some(2000), Some("refund-1")).await?;

    server.verify().await;
    Ok(())
}

#[tokio::test]
async fn test_rejected_cancel_is_not_retryable() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_token(&server, 1).await;
    Mock::given(method("POST"))
        .and(path("/operation/txn-42/cancel"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "code": 1373,
            "message": "Operation already charged"
        })))
        .mount(&server)
        .await;
    let (client, _clock) = client(&server)?;

    let err = client.cancel("txn-42").await.unwrap_err();
    assert!(matches!(err, GatewayError::Rejected { status: 400, .. }));
    assert!(!err.is_retryable());
    Ok(())
}

#[tokio::test]
async fn test_provider_outage_is_retryable() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_token(&server, 1).await;
    Mock::given(method("POST"))
        .and(path("/operation/txn-42/cancel"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    let (client, _clock) = client(&server)?;

    let err = client.cancel("txn-42").await.unwrap_err();
    assert!(err.is_retryable());
    Ok(())
}

#[tokio::test]
async fn test_unreachable_provider_is_transport_error() -> anyhow::Result<()> {
    let cfg = GatewayConfig {
        oauth_url: Some("http://127.0.0.1:1/oauth2/token".to_string()),
        api_url: Some("http://127.0.0.1:1".to_string()),
        request_timeout_secs: 5,
        ..Default::default()
    };

    let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
    let client = GatewayClient::new(cfg, clock)?;

    let err = client.get_token().await.unwrap_err();
    assert!(matches!(err, GatewayError::Transport(_)));
    assert!(err.is_retryable());
    assert!(client.token_cache().current().await.is_none());
    Ok(())
}

#[tokio::test]
async fn test_revoked_token_is_dropped() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_token(&server, 2).await;
    Mock::given(method("POST"))
        .and(path("/operation/txn-42/cancel"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    let (client, _clock) = client(&server)?;

    assert!(client.cancel("txn-42").await.is_err());
    assert!(client.token_cache().current().await.is_none());

    // Next call fetches a new grant.
    client.get_token().await?;
    server.verify().await;
    Ok(())
}

#[tokio::test]
async fn test_charge_saved_card() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    mount_token(&server, 1).await;
    Mock::given(method("POST"))
        .and(path("/payments/cards/auth"))
        .and(body_string_contains("\"invoiceId\":\"000000000042\""))
        .and(body_string_contains("\"id\":\"card-7\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "txn-card",
            "status": "AUTH",
            "approvalCode": "101010",
            "reference": "200100300400"
        })))
        .mount(&server)
        .await;
    let (client, _clock) = client(&server)?;

    let result = client
        .charge_saved_card(&SavedCardCharge {
            invoice_id: "000000000042".to_string(),
            amount: 5000,
            currency: "KZT".to_string(),
            description: "Library subscription".to_string(),
            account_id: "member-1".to_string(),
            card_id: "card-7".to_string(),
        })
        .await?;

    assert_eq!(result.transaction_id.as_deref(), Some("txn-card"));
    assert_eq!(result.status, "AUTH");
    assert!(result.error_code.is_none());
    Ok(())
}
