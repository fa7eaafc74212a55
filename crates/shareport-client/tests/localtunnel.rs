//! LocaltunnelProvider against a fake provider server

use axum::{http::StatusCode, routing::get, Json, Router};
use serde_json::json;
use shareport_client::LocaltunnelProvider;
use shareport_core::{ProviderError, ProviderTunnel, TunnelProvider};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Assignment endpoint handing out `provider_port`; any named subdomain is taken
async fn spawn_assignment_server(provider_port: u16) -> String {
    let app = Router::new()
        .route(
            "/",
            get(move || async move {
                Json(json!({
                    "id": "quick-cat",
                    "port": provider_port,
                    "max_conn_count": 1,
                    "url": "https://quick-cat.loca.lt"
                }))
            }),
        )
        .route(
            "/{subdomain}",
            get(|| async {
                (
                    StatusCode::CONFLICT,
                    Json(json!({ "message": "subdomain is taken" })),
                )
            }),
        );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await });
    format!("http://{}", addr)
}

async fn spawn_echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    port
}

#[tokio::test]
async fn test_visitor_bytes_reach_local_service() {
    let provider_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let provider_port = provider_listener.local_addr().unwrap().port();
    let base = spawn_assignment_server(provider_port).await;
    let local_port = spawn_echo_server().await;

    let provider = LocaltunnelProvider::new(&base).unwrap();
    let tunnel = provider.open(local_port, None).await.unwrap();
    assert_eq!(tunnel.url(), "https://quick-cat.loca.lt");

    // The worker's outbound connection stands in for a visitor
    let (mut visitor, _) = tokio::time::timeout(Duration::from_secs(5), provider_listener.accept())
        .await
        .expect("worker never dialed the provider")
        .unwrap();

    visitor.write_all(b"ping").await.unwrap();
    let mut reply = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(5), visitor.read_exact(&mut reply))
        .await
        .expect("no echo through the tunnel")
        .unwrap();
    assert_eq!(&reply, b"ping");

    tunnel.close().await;
    tokio::time::timeout(Duration::from_secs(1), tunnel.closed())
        .await
        .expect("closed() did not resolve after close()");
}

#[tokio::test]
async fn test_taken_subdomain_is_rejected() {
    let base = spawn_assignment_server(1).await;
    let provider = LocaltunnelProvider::new(&base).unwrap();

    match provider.open(3000, Some("taken")).await {
        Err(ProviderError::Rejected(reason)) => assert_eq!(reason, "subdomain is taken"),
        Err(other) => panic!("expected rejection, got {}", other),
        Ok(_) => panic!("expected rejection, got a tunnel"),
    }
}

#[tokio::test]
async fn test_unreachable_provider_port_loses_tunnel() {
    let provider_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let provider_port = provider_listener.local_addr().unwrap().port();
    drop(provider_listener);

    let base = spawn_assignment_server(provider_port).await;
    let provider = LocaltunnelProvider::new(&base).unwrap();
    let tunnel = provider.open(3000, None).await.unwrap();

    tokio::time::timeout(Duration::from_secs(15), tunnel.closed())
        .await
        .expect("tunnel was not reported lost");
}
