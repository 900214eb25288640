#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use application::{Clock, SystemClock};
use config::{AppConfig, RateRule};
use domain::{CommunityId, Identity, Role, UserId};
use infrastructure::{BcryptPasswordHasher, InMemoryIdentityDirectory, Infrastructure};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::oneshot, time::sleep};
use web_api::{router, AppState};

pub const PASSWORD: &str = "correct horse battery";

pub struct TestUser {
    pub identity: Identity,
    pub email: &'static str,
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    pub community: CommunityId,
    pub alice: TestUser,
    pub bob: TestUser,
    pub moderator: TestUser,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    pub fn http(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws(&self, token: &str) -> String {
        format!("ws://{}/ws?token={}", self.addr, token)
    }

    /// 登录并返回响应体
    pub async fn login(&self, client: &reqwest::Client, email: &str) -> Value {
        let response = client
            .post(self.http("/api/v1/auth/login"))
            .json(&json!({ "email": email, "password": PASSWORD }))
            .send()
            .await
            .expect("login request");
        assert_eq!(response.status(), 200, "login should succeed");
        response.json().await.expect("login json")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.rate_limit.auth = RateRule::new(50, 60);
    config.realtime.outbound_buffer = 16;
    config
}

pub async fn seeded_infrastructure(community: CommunityId) -> (Infrastructure, [TestUser; 3]) {
    let mut infrastructure = Infrastructure::in_memory();
    infrastructure.directory = Arc::new(InMemoryIdentityDirectory::new(Arc::new(
        BcryptPasswordHasher::new(Some(4)),
    )));

    let alice = TestUser {
        identity: Identity::new(UserId::random(), "alice@example.com")
            .with_role(Role::Resident)
            .with_community(community),
        email: "alice@example.com",
    };
    let bob = TestUser {
        identity: Identity::new(UserId::random(), "bob@example.com")
            .with_role(Role::Resident)
            .with_community(community),
        email: "bob@example.com",
    };
    let moderator = TestUser {
        identity: Identity::new(UserId::random(), "mod@example.com").with_role(Role::Moderator),
        email: "mod@example.com",
    };

    for user in [&alice, &bob, &moderator] {
        infrastructure
            .directory
            .register(user.identity.clone(), PASSWORD)
            .await
            .expect("register identity");
    }

    (infrastructure, [alice, bob, moderator])
}

pub async fn spawn_server() -> TestServer {
    spawn_server_with(test_config()).await
}

pub async fn spawn_server_with(config: AppConfig) -> TestServer {
    let community = CommunityId::random();
    let (infrastructure, [alice, bob, moderator]) = seeded_infrastructure(community).await;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let state = AppState::new(&config, &infrastructure, clock);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let app = router(state.clone());

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .await
        .ok();
    });

    // allow server to start
    sleep(Duration::from_millis(50)).await;

    TestServer {
        addr,
        state,
        community,
        alice,
        bob,
        moderator,
        shutdown: Some(shutdown_tx),
    }
}
