use super::*;
use crate::auth::keys::PublicKeyManager;
use crate::core::context::{CallContext, DecodedIdToken, Role};
use crate::core::tests::PRIVATE_KEY;
use async_trait::async_trait;
use httpmock::prelude::*;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const PUBLIC_KEY: &str = "-----BEGIN PUBLIC KEY-----
MIIBIjANBgkqhkiG9w0BAQEFAAOCAQ8AMIIBCgKCAQEA4ShI+Mv1OPAf+XamqEsQ
iJtbsNcEyQ0lL4Mo5coPExcNboWLd8FvWyn7zhuWuLW/rcUg2gVe27h1ZquAJA16
Wauxz/4dvRJSRMIik/RpfJt2peCHjFHoQ+RBwobUweeUbVcxSOJv7ySwEZ1vbBlO
os6fkvAHENho2ABWwA1BYgscJFmIwVveVfkmC1XfFCkHFCRke7WP1+yWWyJwXU9O
BYotJPYU6UwwQBYsic5qI+xlzkVix/XowWdLpQo7KoLe6I3r8vb4y+Q3FpkUH+Up
Yw5stLscO8C+LgkS8RiDCfBcLl01rmGhYdwTVtLyRrUzvASp8sbDWiTqZtsECfCG
NwIDAQAB
-----END PUBLIC KEY-----";

fn identity(uid: &str, roles: &[&str]) -> DecodedIdToken {
    serde_json::from_value(json!({
        "aud": "test-project",
        "iss": "https://securetoken.google.com/test-project",
        "sub": uid,
        "exp": 4_102_444_800u64,
        "iat": 1_700_000_000u64,
        "auth_time": 1_700_000_000u64,
        "roles": roles,
    }))
    .unwrap()
}

/// Accepts a fixed set of tokens and counts every verification attempt.
#[derive(Default)]
struct StubVerifier {
    tokens: HashMap<String, DecodedIdToken>,
    calls: AtomicUsize,
}

impl StubVerifier {
    fn accepting(token: &str, identity: DecodedIdToken) -> Self {
        let mut tokens = HashMap::new();
        tokens.insert(token.to_string(), identity);
        Self {
            tokens,
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityVerifier for StubVerifier {
    async fn verify_id_token(&self, token: &str) -> Result<DecodedIdToken, TokenVerificationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| TokenVerificationError::InvalidToken("unknown token".to_string()))
    }
}

fn guard_with(verifier: Arc<StubVerifier>) -> AuthGuard {
    AuthGuard::new(verifier)
}

fn foo_bar() -> AccessRequirement {
    AccessRequirement::authenticated().with_basic_auth("foo", "bar")
}

#[tokio::test]
async fn test_public_operation_allows_any_credentials() {
    let verifier = Arc::new(StubVerifier::default());
    let guard = guard_with(verifier.clone());
    let requirement = AccessRequirement::public().with_basic_auth("foo", "bar");

    for credentials in [
        RequestCredentials::none(),
        RequestCredentials::from_authorization("Bearer rejected"),
        RequestCredentials::from_authorization("Basic dXNlcjpwYXNz"),
        RequestCredentials::from_authorization("garbage"),
    ] {
        let mut ctx = CallContext::new();
        assert!(guard.can_activate(&requirement, &credentials, &mut ctx).await);
        assert!(ctx.identity().is_none());
    }
    assert_eq!(verifier.calls(), 0);
}

#[tokio::test]
async fn test_basic_auth_accepts_matching_pair() {
    let verifier = Arc::new(StubVerifier::default());
    let guard = guard_with(verifier.clone());
    let mut ctx = CallContext::new();

    let credentials = RequestCredentials::from_authorization("Basic Zm9vOmJhcg==");
    assert!(guard.can_activate(&foo_bar(), &credentials, &mut ctx).await);
    assert!(ctx.identity().is_none());
    assert_eq!(verifier.calls(), 0);
}

#[tokio::test]
async fn test_basic_auth_rejects_mismatches() {
    let guard = guard_with(Arc::new(StubVerifier::default()));

    for header in [
        "Basic dXNlcjpwYXNz", // user:pass
        "Basic YmFyOmZvbw==", // bar:foo
        "Basic Rm9vOmJhcg==", // Foo:bar
        "Basic Zm9vOmJhcmI=", // foo:barb
        "Basic",
        "Basic Zm9vOmJhcg== trailing",
    ] {
        let mut ctx = CallContext::new();
        let credentials = RequestCredentials::from_authorization(header);
        assert!(
            !guard.can_activate(&foo_bar(), &credentials, &mut ctx).await,
            "{header} should be denied"
        );
    }
}

#[tokio::test]
async fn test_basic_auth_without_request_is_denied() {
    let guard = guard_with(Arc::new(StubVerifier::default()));
    let mut ctx = CallContext::new();
    assert!(!guard.can_activate(&foo_bar(), &RequestCredentials::none(), &mut ctx).await);
}

#[tokio::test]
async fn test_basic_header_is_ignored_when_operation_has_no_pair() {
    let guard = guard_with(Arc::new(StubVerifier::default()));
    let mut ctx = CallContext::new();
    let credentials = RequestCredentials::from_authorization("Basic Zm9vOmJhcg==");
    assert!(
        !guard
            .can_activate(&AccessRequirement::authenticated(), &credentials, &mut ctx)
            .await
    );
}

#[tokio::test]
async fn test_verified_bearer_token_attaches_identity() {
    let verifier = Arc::new(StubVerifier::accepting("good-token", identity("uid-1", &["admin"])));
    let guard = guard_with(verifier.clone());
    let mut ctx = CallContext::new();

    let credentials = RequestCredentials::from_authorization("Bearer good-token");
    assert!(
        guard
            .can_activate(&AccessRequirement::authenticated(), &credentials, &mut ctx)
            .await
    );
    assert_eq!(ctx.uid(), Some("uid-1"));
    assert_eq!(ctx.roles(), &[Role::from("admin")]);
    assert_eq!(verifier.calls(), 1);
}

#[tokio::test]
async fn test_rejected_bearer_token_denies_without_touching_context() {
    let verifier = Arc::new(StubVerifier::accepting("good-token", identity("uid-1", &[])));
    let guard = guard_with(verifier.clone());
    let mut ctx = CallContext::new();

    let credentials = RequestCredentials::from_authorization("Bearer bad-token");
    assert!(
        !guard
            .can_activate(&AccessRequirement::authenticated(), &credentials, &mut ctx)
            .await
    );
    assert!(ctx.identity().is_none());
    assert_eq!(verifier.calls(), 1);
}

#[tokio::test]
async fn test_unrecognised_schemes_are_denied_without_verification() {
    let verifier = Arc::new(StubVerifier::default());
    let guard = guard_with(verifier.clone());

    for header in ["Bearer", "Token abc", "bearer abc", "Bearer abc def"] {
        let mut ctx = CallContext::new();
        let credentials = RequestCredentials::from_authorization(header);
        assert!(
            !guard
                .can_activate(&AccessRequirement::authenticated(), &credentials, &mut ctx)
                .await
        );
    }
    assert_eq!(verifier.calls(), 0);
}

#[tokio::test]
async fn test_bearer_token_still_accepted_on_basic_auth_operation() {
    let verifier = Arc::new(StubVerifier::accepting("good-token", identity("uid-1", &[])));
    let guard = guard_with(verifier);
    let mut ctx = CallContext::new();

    let credentials = RequestCredentials::from_authorization("Bearer good-token");
    assert!(guard.can_activate(&foo_bar(), &credentials, &mut ctx).await);
    assert_eq!(ctx.uid(), Some("uid-1"));
}

fn authenticated_context(roles: &[&str]) -> CallContext {
    let mut ctx = CallContext::new();
    ctx.attach_identity(identity("uid-1", roles));
    ctx
}

#[test]
fn test_roles_guard_without_any_role_allows() {
    let guard = RolesGuard::new(None);
    assert!(guard.can_activate(&AccessRequirement::authenticated(), &CallContext::new()));
}

#[test]
fn test_roles_guard_global_and_local_roles_are_both_required() {
    let guard = RolesGuard::new(Some(Role::from("member")));
    let requirement = AccessRequirement::authenticated().requires_role("admin");

    assert!(guard.can_activate(&requirement, &authenticated_context(&["member", "admin"])));
    assert!(guard.can_activate(&requirement, &authenticated_context(&["admin", "member", "extra"])));
    assert!(!guard.can_activate(&requirement, &authenticated_context(&["admin"])));
    assert!(!guard.can_activate(&requirement, &authenticated_context(&["member"])));
    assert!(!guard.can_activate(&requirement, &authenticated_context(&[])));
}

#[test]
fn test_roles_guard_ignoring_global_role() {
    let guard = RolesGuard::new(Some(Role::from("member")));

    let local_only = AccessRequirement::authenticated().requires_role("admin").ignoring_global_role();
    assert!(guard.can_activate(&local_only, &authenticated_context(&["admin"])));
    assert!(!guard.can_activate(&local_only, &authenticated_context(&["member"])));

    let nothing = AccessRequirement::authenticated().ignoring_global_role();
    assert!(guard.can_activate(&nothing, &authenticated_context(&[])));
    assert_eq!(guard.required_roles(&nothing), Vec::<&Role>::new());
}

#[test]
fn test_roles_guard_missing_identity_has_no_roles() {
    let guard = RolesGuard::new(Some(Role::from("member")));
    assert!(!guard.can_activate(&AccessRequirement::authenticated(), &CallContext::new()));
}

#[test]
fn test_roles_guard_public_short_circuits() {
    let guard = RolesGuard::new(Some(Role::from("member")));
    let requirement = AccessRequirement::public().requires_role("admin");
    assert!(guard.can_activate(&requirement, &CallContext::new()));
}

#[test]
fn test_operation_registry_falls_back() {
    let registry = OperationRegistry::new()
        .with_fallback(AccessRequirement::public())
        .declare("secret", AccessRequirement::authenticated().requires_role("admin"));

    assert_eq!(registry.requirement("anything"), AccessRequirement::public());
    assert_eq!(registry.requirement("secret").role, Some(Role::from("admin")));
}

#[tokio::test]
async fn test_access_control_runs_both_guards() {
    let verifier = Arc::new(StubVerifier::accepting("member-token", identity("uid-1", &["member"])));
    let registry = OperationRegistry::new()
        .declare("health", AccessRequirement::public())
        .declare("report", AccessRequirement::authenticated())
        .declare("purge", AccessRequirement::authenticated().requires_role("admin"))
        .declare(
            "import",
            AccessRequirement::authenticated()
                .with_basic_auth("foo", "bar")
                .ignoring_global_role(),
        );
    let access = AccessControl::new(
        Arc::new(registry),
        AuthGuard::new(verifier),
        RolesGuard::new(Some(Role::from("member"))),
    );

    let member = RequestCredentials::from_authorization("Bearer member-token");
    let basic = RequestCredentials::from_authorization("Basic Zm9vOmJhcg==");

    assert!(access.authorize("health", &RequestCredentials::none(), &mut CallContext::new()).await);
    assert!(access.authorize("report", &member, &mut CallContext::new()).await);
    assert!(!access.authorize("purge", &member, &mut CallContext::new()).await);
    assert!(access.authorize("import", &basic, &mut CallContext::new()).await);
    // basic-auth callers carry no roles, so the global role shuts them out
    assert!(!access.authorize("report", &basic, &mut CallContext::new()).await);
}

fn signed_token(kid: &str, claims: serde_json::Value) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_string());
    let key = EncodingKey::from_rsa_pem(PRIVATE_KEY.as_bytes()).unwrap();
    encode(&header, &claims, &key).unwrap()
}

fn claims_for(project: &str, sub: &str) -> serde_json::Value {
    let now = chrono::Utc::now().timestamp();
    json!({
        "aud": project,
        "iss": format!("https://securetoken.google.com/{}", project),
        "sub": sub,
        "user_id": sub,
        "exp": now + 3600,
        "iat": now,
        "auth_time": now,
        "roles": ["admin"],
    })
}

#[tokio::test]
async fn test_id_token_verifier_accepts_signed_token() {
    let server = MockServer::start();
    let keys_mock = server.mock(|when, then| {
        when.method(GET).path("/keys");
        then.status(200)
            .header("content-type", "application/json")
            .header("cache-control", "public, max-age=600")
            .json_body(json!({ "key-1": PUBLIC_KEY }));
    });

    let verifier = IdTokenVerifier::with_key_manager(
        "test-project",
        PublicKeyManager::with_url(server.url("/keys")),
    );

    let token = signed_token("key-1", claims_for("test-project", "uid-1"));
    let decoded = verifier.verify_id_token(&token).await.unwrap();
    assert_eq!(decoded.uid, "uid-1");
    assert_eq!(decoded.roles, vec![Role::from("admin")]);
    assert_eq!(decoded.claims.get("user_id"), Some(&json!("uid-1")));

    // second verification is served from the key cache
    verifier.verify_id_token(&token).await.unwrap();
    keys_mock.assert();
}

#[tokio::test]
async fn test_id_token_verifier_rejects_wrong_audience() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/keys");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({ "key-1": PUBLIC_KEY }));
    });

    let verifier = IdTokenVerifier::with_key_manager(
        "test-project",
        PublicKeyManager::with_url(server.url("/keys")),
    );

    let token = signed_token("key-1", claims_for("other-project", "uid-1"));
    let result = verifier.verify_id_token(&token).await;
    assert!(matches!(result, Err(TokenVerificationError::JwtError(_))));
}

#[tokio::test]
async fn test_id_token_verifier_rejects_unknown_kid() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/keys");
        then.status(200)
            .header("content-type", "application/json")
            .json_body(json!({ "key-1": PUBLIC_KEY }));
    });

    let verifier = IdTokenVerifier::with_key_manager(
        "test-project",
        PublicKeyManager::with_url(server.url("/keys")),
    );

    let token = signed_token("key-2", claims_for("test-project", "uid-1"));
    let result = verifier.verify_id_token(&token).await;
    assert!(matches!(result, Err(TokenVerificationError::KeyFetchError(_))));
}

#[tokio::test]
async fn test_guard_with_real_verifier_denies_garbage_token() {
    let server = MockServer::start();
    let keys_mock = server.mock(|when, then| {
        when.method(GET).path("/keys");
        then.status(200).json_body(json!({}));
    });

    let verifier = IdTokenVerifier::with_key_manager(
        "test-project",
        PublicKeyManager::with_url(server.url("/keys")),
    );
    let guard = AuthGuard::new(Arc::new(verifier));
    let mut ctx = CallContext::new();

    let credentials = RequestCredentials::from_authorization("Bearer not.a.jwt");
    assert!(
        !guard
            .can_activate(&AccessRequirement::authenticated(), &credentials, &mut ctx)
            .await
    );
    assert!(ctx.identity().is_none());
    // header decoding fails before any key lookup
    keys_mock.assert_calls(0);
}
