//! API integration tests for keygate-server.
//!
//! These tests drive the router end-to-end over the in-memory storage
//! backend: the device enrollment/assertion flow with synthetic attestation
//! material, the three-scheme authorization dispatcher, and the completion
//! proxy's quota classification against scratch upstream servers.

use axum::body::Body;
use axum::extract::Json as AxumJson;
use axum::http::{header, Request, StatusCode};
use axum::routing::post;
use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ciborium::value::Value as Cbor;
use jsonwebtoken::{encode, EncodingKey, Header};
use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tower::ServiceExt;

use keygate_server::{
    create_router_with_state, payload_hash, AppState, ChatRequest, Config,
};

const APP_IDENTITY: &str = "TEAMID1234.org.example.app";

// ============================================================================
// Test fixtures
// ============================================================================

async fn test_state(config: Config) -> AppState {
    AppState::from_config(config)
        .await
        .expect("failed to build test state")
}

async fn test_app(config: Config) -> axum::Router {
    create_router_with_state(test_state(config).await)
}

/// Spawn a scratch upstream that answers every completion with a fixed
/// status and body, returning its base URL.
async fn spawn_upstream(status: StatusCode, body: Value) -> String {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(move |AxumJson(_request): AxumJson<Value>| {
            let body = body.clone();
            async move { (status, axum::Json(body)) }
        }),
    );
    spawn_server(app).await
}

/// Spawn a scratch upstream that echoes the forwarded `user` field.
async fn spawn_echo_upstream() -> String {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|AxumJson(request): AxumJson<Value>| async move {
            axum::Json(json!({
                "choices": [],
                "usage": { "prompt_tokens": 3, "completion_tokens": 5 },
                "user_echo": request["user"],
            }))
        }),
    );
    spawn_server(app).await
}

/// Spawn a scratch upstream that streams an event-stream body.
async fn spawn_streaming_upstream() -> String {
    let app = Router::new().route(
        "/v1/chat/completions",
        post(|AxumJson(_request): AxumJson<Value>| async move {
            (
                [(header::CONTENT_TYPE, "text/event-stream")],
                "data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\ndata: [DONE]\n\n",
            )
        }),
    );
    spawn_server(app).await
}

/// Spawn a scratch OAuth introspection oracle.
async fn spawn_oauth_oracle(status: StatusCode, body: Value) -> String {
    let app = Router::new().route(
        "/v1/verify",
        post(move |AxumJson(_request): AxumJson<Value>| {
            let body = body.clone();
            async move { (status, axum::Json(body)) }
        }),
    );
    spawn_server(app).await
}

/// Spawn a scratch integrity oracle returning a fixed verdict envelope.
async fn spawn_integrity_oracle(envelope: Value) -> String {
    let app = Router::new().route(
        "/v1/integrity:decode",
        post(move |AxumJson(_request): AxumJson<Value>| {
            let envelope = envelope.clone();
            async move { axum::Json(envelope) }
        }),
    );
    spawn_server(app).await
}

async fn spawn_server(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind scratch server");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

// ============================================================================
// Device-side crypto fixtures
// ============================================================================

/// A synthetic enrolled device: P-256 key plus its derived key identifier.
struct TestDevice {
    signing_key: SigningKey,
    key_id: Vec<u8>,
    key_id_b64: String,
}

impl TestDevice {
    fn generate() -> Self {
        let signing_key = SigningKey::random(&mut rand::rngs::OsRng);
        let point = signing_key.verifying_key().to_encoded_point(false);
        let key_id: Vec<u8> = Sha256::digest(point.as_bytes()).to_vec();
        let key_id_b64 = URL_SAFE_NO_PAD.encode(&key_id);
        Self {
            signing_key,
            key_id,
            key_id_b64,
        }
    }

    fn cose_key(&self) -> Vec<u8> {
        let point = self.signing_key.verifying_key().to_encoded_point(false);
        let value = Cbor::Map(vec![
            (Cbor::from(1), Cbor::from(2)),
            (Cbor::from(-1), Cbor::from(1)),
            (Cbor::from(-2), Cbor::Bytes(point.x().unwrap().to_vec())),
            (Cbor::from(-3), Cbor::Bytes(point.y().unwrap().to_vec())),
        ]);
        let mut out = Vec::new();
        ciborium::into_writer(&value, &mut out).unwrap();
        out
    }

    /// Authenticator data with the full attested-credential layout.
    fn enrollment_auth_data(&self, counter: u32) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&Sha256::digest(APP_IDENTITY.as_bytes()));
        data.push(0x40);
        data.extend_from_slice(&counter.to_be_bytes());
        data.extend_from_slice(b"appattestdevelop");
        data.extend_from_slice(&(self.key_id.len() as u16).to_be_bytes());
        data.extend_from_slice(&self.key_id);
        data.extend_from_slice(&self.cose_key());
        data
    }

    /// CBOR attestation object over the given challenge state.
    fn attestation_object(&self, counter: u32) -> Vec<u8> {
        let value = Cbor::Map(vec![
            (
                Cbor::Text("fmt".into()),
                Cbor::Text("apple-appattest".into()),
            ),
            (
                Cbor::Text("attStmt".into()),
                Cbor::Map(vec![
                    (
                        Cbor::Text("x5c".into()),
                        Cbor::Array(vec![Cbor::Bytes(vec![0x30, 0x03, 0x02, 0x01, 0x01])]),
                    ),
                    (Cbor::Text("receipt".into()), Cbor::Bytes(vec![])),
                ]),
            ),
            (
                Cbor::Text("authData".into()),
                Cbor::Bytes(self.enrollment_auth_data(counter)),
            ),
        ]);
        let mut out = Vec::new();
        ciborium::into_writer(&value, &mut out).unwrap();
        out
    }

    /// Signed CBOR assertion over the payload digest.
    fn assertion(&self, counter: u32, expected_hash: &[u8; 32]) -> Vec<u8> {
        let mut auth_data = Vec::new();
        auth_data.extend_from_slice(&Sha256::digest(APP_IDENTITY.as_bytes()));
        auth_data.push(0x40);
        auth_data.extend_from_slice(&counter.to_be_bytes());

        let mut hasher = Sha256::new();
        hasher.update(&auth_data);
        hasher.update(expected_hash);
        let nonce: [u8; 32] = hasher.finalize().into();
        let signature: Signature = self.signing_key.sign(&nonce);

        let value = Cbor::Map(vec![
            (
                Cbor::Text("signature".into()),
                Cbor::Bytes(signature.to_der().as_bytes().to_vec()),
            ),
            (
                Cbor::Text("authenticatorData".into()),
                Cbor::Bytes(auth_data),
            ),
        ]);
        let mut out = Vec::new();
        ciborium::into_writer(&value, &mut out).unwrap();
        out
    }
}

/// Encode a carrier bearer token; the signature is irrelevant to the
/// gateway, only the payload is read.
fn carrier_token(claims: Value) -> String {
    let mut claims = claims;
    claims["iat"] = json!(1_700_000_000u64);
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(b"device-side-secret"),
    )
    .unwrap()
}

fn attest_carrier(device: &TestDevice, challenge: &str, counter: u32) -> String {
    carrier_token(json!({
        "key_id": device.key_id_b64,
        "challenge": URL_SAFE_NO_PAD.encode(challenge.as_bytes()),
        "attestation_object": URL_SAFE_NO_PAD.encode(device.attestation_object(counter)),
        "app_binding_id": "org.example.app",
    }))
}

fn assertion_carrier(
    device: &TestDevice,
    challenge: &str,
    counter: u32,
    expected_hash: &[u8; 32],
) -> String {
    carrier_token(json!({
        "key_id": device.key_id_b64,
        "challenge": URL_SAFE_NO_PAD.encode(challenge.as_bytes()),
        "assertion": URL_SAFE_NO_PAD.encode(device.assertion(counter, expected_hash)),
    }))
}

// ============================================================================
// Request helpers
// ============================================================================

async fn fetch_challenge(app: &Router, key_id_b64: &str) -> String {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/challenge?key_id={key_id_b64}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await["challenge"]
        .as_str()
        .unwrap()
        .to_string()
}

async fn post_attest(app: &Router, carrier: &str) -> axum::response::Response {
    app.clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/attest")
                .header(header::AUTHORIZATION, format!("Bearer {carrier}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
}

fn chat_request() -> ChatRequest {
    ChatRequest {
        messages: vec![json!({"role": "user", "content": "hello"})],
        ..ChatRequest::default()
    }
}

/// The digest the device must sign: the request after server-side defaults.
fn signed_payload_hash(config: &Config, request: &ChatRequest) -> [u8; 32] {
    let mut request = request.clone();
    request.apply_defaults(config);
    payload_hash(&request).unwrap()
}

fn completion_request(chat: &ChatRequest, headers: &[(&str, String)]) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header(header::CONTENT_TYPE, "application/json")
        .header("service-type", "ai");
    for (name, value) in headers {
        builder = builder.header(*name, value);
    }
    builder
        .body(Body::from(serde_json::to_vec(chat).unwrap()))
        .unwrap()
}

// ============================================================================
// Health & Readiness
// ============================================================================

#[tokio::test]
async fn test_health_endpoint_returns_ok() {
    let app = test_app(Config::default()).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["storage_persistent"], false);
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_ready_endpoint_returns_ok() {
    let app = test_app(Config::default()).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/ready")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["ready"], true);
}

// ============================================================================
// Challenge issuance
// ============================================================================

#[tokio::test]
async fn test_challenge_is_hex_and_idempotent() {
    let app = test_app(Config::default()).await;

    let first = fetch_challenge(&app, "device-abc").await;
    assert_eq!(first.len(), 64);
    assert!(first.chars().all(|c| c.is_ascii_hexdigit()));

    // Re-issue within the TTL returns the identical value.
    let second = fetch_challenge(&app, "device-abc").await;
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_challenge_requires_key_id() {
    let app = test_app(Config::default()).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/challenge?key_id=")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// ============================================================================
// Attestation enrollment
// ============================================================================

#[tokio::test]
async fn test_attest_enrolls_device_key() {
    let state = test_state(Config::default()).await;
    let app = create_router_with_state(state.clone());
    let device = TestDevice::generate();

    let challenge = fetch_challenge(&app, &device.key_id_b64).await;
    let response = post_attest(&app, &attest_carrier(&device, &challenge, 0)).await;

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(body_json(response).await["status"], "success");

    let record = state
        .store
        .get_device_key(&device.key_id_b64)
        .await
        .unwrap()
        .expect("device key enrolled");
    assert_eq!(record.counter, 0);
}

#[tokio::test]
async fn test_attest_replay_after_consumed_challenge_is_rejected() {
    let app = test_app(Config::default()).await;
    let device = TestDevice::generate();

    let challenge = fetch_challenge(&app, &device.key_id_b64).await;
    let carrier = attest_carrier(&device, &challenge, 0);

    let first = post_attest(&app, &carrier).await;
    assert_eq!(first.status(), StatusCode::CREATED);

    // The challenge was consumed by the first attempt.
    let second = post_attest(&app, &carrier).await;
    assert_eq!(second.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_attest_with_wrong_challenge_is_rejected() {
    let app = test_app(Config::default()).await;
    let device = TestDevice::generate();

    // Issue a real challenge but present a different value.
    fetch_challenge(&app, &device.key_id_b64).await;
    let response = post_attest(&app, &attest_carrier(&device, "0000", 0)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_attest_with_foreign_key_material_is_forbidden() {
    let app = test_app(Config::default()).await;
    let device = TestDevice::generate();
    let other = TestDevice::generate();

    // Carrier claims `device`'s key id but ships `other`'s attestation.
    let challenge = fetch_challenge(&app, &device.key_id_b64).await;
    let carrier = carrier_token(json!({
        "key_id": device.key_id_b64,
        "challenge": URL_SAFE_NO_PAD.encode(challenge.as_bytes()),
        "attestation_object": URL_SAFE_NO_PAD.encode(other.attestation_object(0)),
        "app_binding_id": "org.example.app",
    }));

    let response = post_attest(&app, &carrier).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

// ============================================================================
// Device-asserted completions
// ============================================================================

async fn enrolled_device(app: &Router) -> TestDevice {
    let device = TestDevice::generate();
    let challenge = fetch_challenge(app, &device.key_id_b64).await;
    let response = post_attest(app, &attest_carrier(&device, &challenge, 0)).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    device
}

#[tokio::test]
async fn test_device_asserted_completion_and_replay_rejection() {
    let upstream = spawn_echo_upstream().await;
    let config = Config {
        upstream_api_base: upstream,
        ..Config::default()
    };
    let chat = chat_request();
    let expected_hash = signed_payload_hash(&config, &chat);

    let app = test_app(config).await;
    let device = enrolled_device(&app).await;

    // Assert with counter 1 over a fresh challenge.
    let challenge = fetch_challenge(&app, &device.key_id_b64).await;
    let carrier = assertion_carrier(&device, &challenge, 1, &expected_hash);
    let response = app
        .clone()
        .oneshot(completion_request(
            &chat,
            &[
                ("authorization", format!("Bearer {carrier}")),
                ("use-device-attest", "true".to_string()),
            ],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(
        json["user_echo"],
        format!("{}:ai", device.key_id_b64),
        "principal is key_id:service_type"
    );

    // Replaying the identical request fails: the challenge is consumed.
    let replay = app
        .clone()
        .oneshot(completion_request(
            &chat,
            &[
                ("authorization", format!("Bearer {carrier}")),
                ("use-device-attest", "true".to_string()),
            ],
        ))
        .await
        .unwrap();
    assert_eq!(replay.status(), StatusCode::UNAUTHORIZED);

    // A fresh challenge with a non-advancing counter is a replay.
    let challenge = fetch_challenge(&app, &device.key_id_b64).await;
    let stale = assertion_carrier(&device, &challenge, 1, &expected_hash);
    let response = app
        .clone()
        .oneshot(completion_request(
            &chat,
            &[
                ("authorization", format!("Bearer {stale}")),
                ("use-device-attest", "true".to_string()),
            ],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Advancing the counter succeeds again.
    let challenge = fetch_challenge(&app, &device.key_id_b64).await;
    let next = assertion_carrier(&device, &challenge, 2, &expected_hash);
    let response = app
        .clone()
        .oneshot(completion_request(
            &chat,
            &[
                ("authorization", format!("Bearer {next}")),
                ("use-device-attest", "true".to_string()),
            ],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_device_assertion_over_tampered_payload_is_rejected() {
    let upstream = spawn_echo_upstream().await;
    let config = Config {
        upstream_api_base: upstream,
        ..Config::default()
    };
    let chat = chat_request();
    let expected_hash = signed_payload_hash(&config, &chat);

    let app = test_app(config).await;
    let device = enrolled_device(&app).await;

    // Sign the original payload but send a different one.
    let challenge = fetch_challenge(&app, &device.key_id_b64).await;
    let carrier = assertion_carrier(&device, &challenge, 1, &expected_hash);
    let tampered = ChatRequest {
        messages: vec![json!({"role": "user", "content": "something else"})],
        ..ChatRequest::default()
    };
    let response = app
        .oneshot(completion_request(
            &tampered,
            &[
                ("authorization", format!("Bearer {carrier}")),
                ("use-device-attest", "true".to_string()),
            ],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

// ============================================================================
// Authorization dispatcher
// ============================================================================

#[tokio::test]
async fn test_missing_authorization_is_rejected_with_generic_message() {
    let app = test_app(Config::default()).await;

    let response = app
        .oneshot(completion_request(&chat_request(), &[]))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = body_json(response).await;
    assert_eq!(
        json["error"],
        "Unauthorized: Please authenticate with a supported scheme"
    );
}

#[tokio::test]
async fn test_missing_service_type_is_rejected() {
    let app = test_app(Config::default()).await;

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .header(header::CONTENT_TYPE, "application/json")
                .header(header::AUTHORIZATION, "Bearer some-token")
                .body(Body::from(
                    serde_json::to_vec(&chat_request()).unwrap(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_service_type_is_rejected() {
    let app = test_app(Config::default()).await;

    let mut request = completion_request(
        &chat_request(),
        &[("authorization", "Bearer some-token".to_string())],
    );
    request
        .headers_mut()
        .insert("service-type", "video".parse().unwrap());
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_scheme_exclusivity_device_wins() {
    let app = test_app(Config::default()).await;

    // Both scheme flags set with a garbage carrier: the device scheme is
    // selected and fails on the carrier, never falling through to the
    // integrity scheme.
    let response = app
        .oneshot(completion_request(
            &chat_request(),
            &[
                ("authorization", "Bearer not.a.carrier".to_string()),
                ("use-device-attest", "true".to_string()),
                ("use-platform-integrity", "true".to_string()),
            ],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = body_json(response).await;
    assert_eq!(json["error"], "Invalid bearer payload");
}

// ============================================================================
// OAuth scheme
// ============================================================================

#[tokio::test]
async fn test_oauth_completion_uses_introspected_subject() {
    let upstream = spawn_echo_upstream().await;
    let oracle = spawn_oauth_oracle(StatusCode::OK, json!({"user": "oauth-user-1"})).await;
    let config = Config {
        upstream_api_base: upstream,
        oauth_verify_url: format!("{oracle}/v1/verify"),
        ..Config::default()
    };
    let app = test_app(config).await;

    let response = app
        .oneshot(completion_request(
            &chat_request(),
            &[("authorization", "Bearer opaque-oauth-token".to_string())],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["user_echo"], "oauth-user-1:ai");
}

#[tokio::test]
async fn test_oauth_rejection_maps_to_401() {
    let upstream = spawn_echo_upstream().await;
    let oracle = spawn_oauth_oracle(
        StatusCode::UNAUTHORIZED,
        json!({"error": "invalid token"}),
    )
    .await;
    let config = Config {
        upstream_api_base: upstream,
        oauth_verify_url: format!("{oracle}/v1/verify"),
        ..Config::default()
    };
    let app = test_app(config).await;

    let response = app
        .oneshot(completion_request(
            &chat_request(),
            &[("authorization", "Bearer expired-token".to_string())],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

// ============================================================================
// Platform integrity scheme
// ============================================================================

fn verdict_envelope(user_id: &str, package: &str) -> Value {
    json!({
        "tokenPayloadExternal": {
            "requestDetails": {
                "requestPackageName": package,
                "requestHash": hex::encode(Sha256::digest(user_id.as_bytes())),
            },
            "appIntegrity": { "appRecognitionVerdict": "PLAY_RECOGNIZED" },
            "deviceIntegrity": {
                "deviceRecognitionVerdict": ["MEETS_DEVICE_INTEGRITY"]
            },
        }
    })
}

#[tokio::test]
async fn test_integrity_exchange_and_completion() {
    let upstream = spawn_echo_upstream().await;
    let oracle = spawn_integrity_oracle(verdict_envelope("user-42", "org.example.app")).await;
    let config = Config {
        upstream_api_base: upstream,
        integrity_decode_url: format!("{oracle}/v1/integrity:decode"),
        ..Config::default()
    };
    let app = test_app(config).await;

    // Exchange the integrity token for a gateway access token.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/verify/integrity")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({"integrity_token": "opaque", "user_id": "user-42"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let exchange = body_json(response).await;
    assert_eq!(exchange["token_type"], "Bearer");
    assert_eq!(exchange["expires_in"], 3600);
    let access_token = exchange["access_token"].as_str().unwrap().to_string();

    // Use the issued token on the completion endpoint.
    let response = app
        .oneshot(completion_request(
            &chat_request(),
            &[
                ("authorization", format!("Bearer {access_token}")),
                ("use-platform-integrity", "true".to_string()),
            ],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["user_echo"], "user-42:ai");
}

#[tokio::test]
async fn test_integrity_exchange_rejects_wrong_package() {
    let oracle = spawn_integrity_oracle(verdict_envelope("user-42", "org.example.other")).await;
    let config = Config {
        integrity_decode_url: format!("{oracle}/v1/integrity:decode"),
        ..Config::default()
    };
    let app = test_app(config).await;

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/verify/integrity")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({"integrity_token": "opaque", "user_id": "user-42"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_forged_access_token_is_rejected() {
    let upstream = spawn_echo_upstream().await;
    let config = Config {
        upstream_api_base: upstream,
        ..Config::default()
    };
    let app = test_app(config).await;

    // A token signed with a different secret.
    let forged = keygate_server::TokenIssuer::new("wrong-secret", 3600)
        .issue("user-42")
        .unwrap();
    let response = app
        .oneshot(completion_request(
            &chat_request(),
            &[
                ("authorization", format!("Bearer {forged}")),
                ("use-platform-integrity", "true".to_string()),
            ],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

// ============================================================================
// Completion proxy: quota classification
// ============================================================================

async fn oauth_app_with_upstream(status: StatusCode, body: Value) -> Router {
    let upstream = spawn_upstream(status, body).await;
    let oracle = spawn_oauth_oracle(StatusCode::OK, json!({"user": "oauth-user-1"})).await;
    let config = Config {
        upstream_api_base: upstream,
        oauth_verify_url: format!("{oracle}/v1/verify"),
        ..Config::default()
    };
    test_app(config).await
}

#[tokio::test]
async fn test_budget_exhaustion_maps_to_429_code_1() {
    let app = oauth_app_with_upstream(
        StatusCode::BAD_REQUEST,
        json!({"error": {"message": "Budget has been exceeded for this key"}}),
    )
    .await;

    let response = app
        .oneshot(completion_request(
            &chat_request(),
            &[("authorization", "Bearer token".to_string())],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        response.headers().get(header::RETRY_AFTER).unwrap(),
        "86400"
    );
    assert_eq!(body_json(response).await, json!({"error": 1}));
}

#[tokio::test]
async fn test_rate_limit_maps_to_429_code_2() {
    let app = oauth_app_with_upstream(
        StatusCode::TOO_MANY_REQUESTS,
        json!({"error": {"message": "Rate limit exceeded (TPM)"}}),
    )
    .await;

    let response = app
        .oneshot(completion_request(
            &chat_request(),
            &[("authorization", "Bearer token".to_string())],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "60");
    assert_eq!(body_json(response).await, json!({"error": 2}));
}

#[tokio::test]
async fn test_unclassified_upstream_error_passes_status_through() {
    let app = oauth_app_with_upstream(
        StatusCode::SERVICE_UNAVAILABLE,
        json!({"error": {"message": "backend exploded"}}),
    )
    .await;

    let response = app
        .oneshot(completion_request(
            &chat_request(),
            &[("authorization", "Bearer token".to_string())],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_unreachable_upstream_maps_to_502() {
    let oracle = spawn_oauth_oracle(StatusCode::OK, json!({"user": "oauth-user-1"})).await;
    let config = Config {
        // Nothing is listening here.
        upstream_api_base: "http://127.0.0.1:1".to_string(),
        oauth_verify_url: format!("{oracle}/v1/verify"),
        ..Config::default()
    };
    let app = test_app(config).await;

    let response = app
        .oneshot(completion_request(
            &chat_request(),
            &[("authorization", "Bearer token".to_string())],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
}

// ============================================================================
// Completion proxy: streaming
// ============================================================================

#[tokio::test]
async fn test_streaming_completion_relays_event_stream() {
    let upstream = spawn_streaming_upstream().await;
    let oracle = spawn_oauth_oracle(StatusCode::OK, json!({"user": "oauth-user-1"})).await;
    let config = Config {
        upstream_api_base: upstream,
        oauth_verify_url: format!("{oracle}/v1/verify"),
        ..Config::default()
    };
    let app = test_app(config).await;

    let chat = ChatRequest {
        stream: true,
        ..chat_request()
    };
    let response = app
        .oneshot(completion_request(
            &chat,
            &[("authorization", "Bearer token".to_string())],
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/event-stream")));

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(body.contains("data:"));
    assert!(body.contains("[DONE]"));
}

#[tokio::test]
async fn test_streaming_quota_failure_is_classified_before_relay() {
    let app = oauth_app_with_upstream(
        StatusCode::TOO_MANY_REQUESTS,
        json!({"error": {"message": "Rate limit exceeded (RPM)"}}),
    )
    .await;

    let chat = ChatRequest {
        stream: true,
        ..chat_request()
    };
    let response = app
        .oneshot(completion_request(
            &chat,
            &[("authorization", "Bearer token".to_string())],
        ))
        .await
        .unwrap();

    // No bytes were relayed yet, so the classification still controls the
    // response status.
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "60");
    assert_eq!(body_json(response).await, json!({"error": 2}));
}
