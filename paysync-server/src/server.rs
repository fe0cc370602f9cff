//! Axum router setup.

use crate::auth::api_key_middleware;
use crate::handlers::{amounts, notify, orders, realtime};
use crate::state::AppState;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use paysync_core::protocol::{PATH_NOTIFY, PATH_ORDERS_SYNC, PATH_REALTIME};
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

pub fn build_router(state: AppState) -> Router {
    // API-key authenticated routes
    let api = Router::new()
        .route(PATH_NOTIFY, post(notify::notify))
        .route(PATH_ORDERS_SYNC, get(orders::sync))
        .route("/api/v1/orders", post(orders::register_order))
        .route("/api/v1/orders/{id}/approve", post(orders::approve))
        .route("/api/v1/orders/{id}/reject", post(orders::reject))
        .route("/api/v1/generate-amount", post(amounts::generate_amount))
        .route("/api/v1/amounts/{id}/cancel", post(amounts::cancel_amount))
        .route(PATH_REALTIME, get(realtime::realtime))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            api_key_middleware,
        ));

    let public = Router::new().route("/health", get(health));

    let body_limit = state.config.max_payload_size;
    Router::new()
        .merge(api)
        .merge(public)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(body_limit))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::{state, API_KEY, SECRET};
    use crate::orders::SqliteOrderBook;
    use crate::storage::approvals;
    use async_trait::async_trait;
    use paysync_core::models::{
        ApprovalMode, ApprovalStatus, CaptureSource, Confidence, Direction, Transaction,
    };
    use paysync_core::money::Amount;
    use paysync_core::orphan::{OrphanStatus, OrphanStore};
    use paysync_core::protocol::RegisterOrderRequest;
    use paysync_core::realtime::{
        ChannelEvent, ChannelSettings, ConnectionBoard, ConnectionState, EventSink,
        RealtimeChannel,
    };
    use paysync_core::store::LocalStore;
    use paysync_core::sync::{HttpServerClient, ServerApi, ServerEndpoint, SyncEngine};
    use paysync_core::{now_ms, PaySyncError, TransactionIngestor};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::{mpsc, watch};
    use tokio_util::sync::CancellationToken;

    async fn serve(state: AppState) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn endpoint(base_url: &str, api_key: &str) -> ServerEndpoint {
        ServerEndpoint {
            id: "shop".into(),
            base_url: base_url.into(),
            ws_url: None,
            api_key: api_key.into(),
            shared_secret: SECRET.into(),
        }
    }

    struct Device {
        engine: Arc<SyncEngine>,
        ingestor: TransactionIngestor,
        orphans: OrphanStore,
    }

    fn device(base_url: &str) -> Device {
        let store = LocalStore::in_memory().unwrap();
        let api: Arc<dyn ServerApi> =
            Arc::new(HttpServerClient::new(endpoint(base_url, API_KEY), "dev-1").unwrap());
        let engine = Arc::new(SyncEngine::new(api, store.clone()));
        let orphans = OrphanStore::new(store);
        Device {
            ingestor: TransactionIngestor::new(vec![engine.clone()], orphans.clone()),
            engine,
            orphans,
        }
    }

    fn credit(amount: &str) -> Transaction {
        Transaction::new(
            "BCA",
            Direction::Credit,
            Amount::parse(amount).unwrap(),
            now_ms(),
            CaptureSource::Sms,
        )
    }

    fn register(state: &AppState, order_id: &str, total: &str) {
        state
            .matcher
            .register_order(
                &RegisterOrderRequest {
                    order_id: order_id.into(),
                    total: Amount::parse(total).unwrap(),
                    bank_hint: None,
                },
                now_ms(),
            )
            .unwrap();
    }

    #[tokio::test]
    async fn reserved_checkout_amount_matches_over_http() {
        let state = state(ApprovalMode::Auto);
        let base_url = serve(state.clone()).await;
        let device = device(&base_url);

        state
            .allocator
            .reserve(Amount::from_units(500).unwrap(), 30, Some("wc-500"))
            .unwrap();

        let outcome = device.ingestor.ingest(&credit("500.01")).await.unwrap();
        assert_eq!(outcome.matched.len(), 1);
        let (_, details) = &outcome.matched[0];
        assert_eq!(details.confidence, Confidence::High);
        assert_eq!(details.status, ApprovalStatus::AutoApproved);
        assert_eq!(details.order_id.as_deref(), Some("wc-500"));
        assert!(!outcome.orphaned);
        assert!(device.orphans.list(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn orphan_is_reconciled_when_its_order_arrives() {
        let state = state(ApprovalMode::Auto);
        let base_url = serve(state.clone()).await;
        let device = device(&base_url);

        let outcome = device.ingestor.ingest(&credit("750.00")).await.unwrap();
        assert!(outcome.matched.is_empty());
        assert!(outcome.orphaned);
        {
            let conn = state.storage.conn().unwrap();
            assert!(approvals::list_since(&conn, 0, 100).unwrap().is_empty());
        }

        register(&state, "wc-750", "750.00");

        let report = device.engine.sync_cycle().await.unwrap();
        assert_eq!(report.reconciled, 1);

        let approval = {
            let conn = state.storage.conn().unwrap();
            approvals::for_order(&conn, "wc-750").unwrap().unwrap()
        };
        assert_eq!(approval.status, ApprovalStatus::AutoApproved);
        assert_eq!(approval.approved_by.as_deref(), Some("system"));
        assert_eq!(approval.confidence, Some(Confidence::Medium));
        assert!(approval.transaction.is_some());
        assert!(SqliteOrderBook::new(state.storage.clone())
            .is_paid("wc-750")
            .unwrap());

        let matched = device.orphans.list(Some(OrphanStatus::Matched)).unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].matched_order_id.as_deref(), Some("wc-750"));
    }

    #[tokio::test]
    async fn wrong_api_key_is_unauthorized() {
        let state = state(ApprovalMode::Auto);
        let base_url = serve(state).await;
        let client = HttpServerClient::new(endpoint(&base_url, "wrong"), "dev-1").unwrap();
        match client.pull(0, 10).await {
            Err(PaySyncError::Server { status, .. }) => assert_eq!(status, 401),
            other => panic!("expected 401, got {:?}", other.map(|d| d.latest_version)),
        }
    }

    struct Recorder(mpsc::UnboundedSender<ChannelEvent>);

    #[async_trait]
    impl EventSink for Recorder {
        async fn on_event(&self, event: ChannelEvent) {
            let _ = self.0.send(event);
        }
    }

    #[tokio::test]
    async fn realtime_hub_pushes_new_orders() {
        let state = state(ApprovalMode::Auto);
        let base_url = serve(state.clone()).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let board = ConnectionBoard::new();
        let channel = RealtimeChannel::new(
            &endpoint(&base_url, API_KEY),
            "dev-1",
            Arc::new(Recorder(tx)),
            board.clone(),
            ChannelSettings {
                heartbeat: Duration::from_millis(100),
                ..ChannelSettings::default()
            },
        )
        .unwrap();
        let cancel = CancellationToken::new();
        let (_network, network_rx) = watch::channel(true);
        let task = tokio::spawn(channel.run(cancel.clone(), network_rx));

        let mut connected = false;
        for _ in 0..200 {
            if board.get("shop").map(|c| c.state) == Some(ConnectionState::Connected) {
                connected = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(connected, "device never connected");

        register(&state, "wc-rt", "42.00");
        let event = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Some(ChannelEvent::NewOrder(data)) => return data,
                    Some(_) => continue,
                    None => panic!("sink closed"),
                }
            }
        })
        .await
        .expect("no new_order frame");
        assert_eq!(event["order_id"], "wc-rt");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("channel did not stop")
            .unwrap();
    }
}
