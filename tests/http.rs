use std::{net::SocketAddr, sync::Arc};

use futures_util::{SinkExt, StreamExt};
use kinlink::{
    clock::{Clock, ManualClock, SharedClock},
    config::Config,
    db::{AccountRole, Db},
    router,
    testing::RecordingNotifier,
    AppState,
};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;

struct Server {
    addr: SocketAddr,
    db: Db,
    clock: Arc<ManualClock>,
    http: reqwest::Client,
}

impl Server {
    async fn start() -> Self {
        let db = Db::in_memory().await.unwrap();
        let clock = Arc::new(ManualClock::default());
        let shared: SharedClock = clock.clone();
        let state = AppState::build(
            Config::default(),
            db.clone(),
            shared,
            Arc::new(RecordingNotifier::default()),
        )
        .await
        .unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });

        Self {
            addr,
            db,
            clock,
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let res = self.http.post(self.url(path)).json(&body).send().await.unwrap();
        (res.status().as_u16(), res.json().await.unwrap())
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let res = self.http.get(self.url(path)).send().await.unwrap();
        (res.status().as_u16(), res.json().await.unwrap())
    }
}

#[tokio::test]
async fn health() {
    let server = Server::start().await;
    let body = reqwest::get(server.url("/health")).await.unwrap().text().await.unwrap();
    assert_eq!(body, "OK");
}

#[tokio::test]
async fn elder_displays_code_family_confirms() {
    let server = Server::start().await;
    let family = server
        .db
        .create_user("daughter", AccountRole::Family, server.clock.now())
        .await
        .unwrap();

    let (status, issued) = server.post("/pairing/request_code", json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(issued["expires_in_seconds"], 600);
    let code = issued["pairing_code"].as_str().unwrap().to_owned();

    let (status, body) = server.get(&format!("/pairing/check_status/{code}")).await;
    assert_eq!((status, body), (200, json!({"status": "waiting"})));

    let (status, body) = server
        .post(
            "/pairing/confirm",
            json!({"family_id": family, "code": code, "elder_name": "阿公", "gender": "male", "age": 80}),
        )
        .await;
    assert_eq!(status, 200);
    let elder_id = body["elder_id"].as_i64().unwrap();

    let (status, body) = server.get(&format!("/pairing/check_status/{code}")).await;
    assert_eq!(status, 200);
    assert_eq!(body, json!({"status": "paired", "elder_id": elder_id, "elder_name": "阿公"}));

    let (status, body) = server.get(&format!("/elders_for/{family}")).await;
    assert_eq!(status, 200);
    assert_eq!(body[0]["id"], elder_id);
    assert_eq!(body[0]["name"], "阿公");
    assert_eq!(body[0]["is_online"], false);
}

#[tokio::test]
async fn family_generates_code_elder_verifies() {
    let server = Server::start().await;
    let now = server.clock.now();
    let family = server.db.create_user("son", AccountRole::Family, now).await.unwrap();
    let elder = server.db.create_user("grandma", AccountRole::Elder, now).await.unwrap();

    let (status, issued) = server.post("/pairing/generate", json!({"family_id": family})).await;
    assert_eq!(status, 200);
    let code = issued["pairing_code"].as_str().unwrap().to_owned();

    let (status, body) = server
        .post("/pairing/verify", json!({"elder_id": elder, "code": code}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body, json!({"message": "Successfully paired!", "family_id": family}));

    let (status, _) = server
        .post("/pairing/verify", json!({"elder_id": elder, "code": code}))
        .await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn bad_requests_map_to_statuses() {
    let server = Server::start().await;
    let elder = server
        .db
        .create_user("grandpa", AccountRole::Elder, server.clock.now())
        .await
        .unwrap();

    let (status, body) = server.post("/pairing/verify", json!({"code": "123456"})).await;
    assert_eq!(status, 400);
    assert!(body["error"].is_string());

    let (status, _) = server.post("/pairing/generate", json!({})).await;
    assert_eq!(status, 400);

    let (status, _) = server.post("/pairing/generate", json!({"family_id": elder})).await;
    assert_eq!(status, 403);

    let (status, _) = server.get("/pairing/check_status/999999").await;
    assert_eq!(status, 404);

    let (status, _) = server.get("/elders_for/4242").await;
    assert_eq!(status, 404);

    let (status, _) = server.get(&format!("/elders_for/{elder}")).await;
    assert_eq!(status, 403);
}

async fn next_event<S>(ws: &mut S) -> Value
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = tokio::time::timeout(std::time::Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

#[tokio::test]
async fn websocket_join_and_relay() {
    let server = Server::start().await;
    let url = format!("ws://{}/ws", server.addr);

    let (mut elder, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let welcome = next_event(&mut elder).await;
    assert_eq!(welcome["event"], "welcome");
    let elder_id = welcome["data"]["id"].clone();

    let join = json!({"event": "join", "data": {"room": "family-42", "role": "elder", "deviceName": "阿公"}});
    elder.send(Message::text(join.to_string())).await.unwrap();

    let (mut family, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let family_id = next_event(&mut family).await["data"]["id"].clone();
    let join = json!({"event": "join", "data": {"room": "family-42", "role": "family", "deviceName": "phone"}});
    family.send(Message::text(join.to_string())).await.unwrap();

    let list = next_event(&mut family).await;
    assert_eq!(list["event"], "elder-list");
    assert_eq!(list["data"][0]["id"], elder_id);
    assert_eq!(list["data"][0]["deviceName"], "阿公");

    let joined = next_event(&mut elder).await;
    assert_eq!(joined["event"], "member-joined");
    assert_eq!(joined["data"]["id"], family_id);

    let offer = json!({"event": "offer", "data": {"targetId": elder_id, "payload": {"sdp": "v=0"}}});
    family.send(Message::text(offer.to_string())).await.unwrap();

    let relayed = next_event(&mut elder).await;
    assert_eq!(relayed["event"], "offer");
    assert_eq!(relayed["data"]["senderId"], family_id);
    assert_eq!(relayed["data"]["payload"], json!({"sdp": "v=0"}));

    family.close(None).await.unwrap();
    let left = next_event(&mut elder).await;
    assert_eq!(left, json!({"event": "member-left", "data": {"id": family_id}}));
}
