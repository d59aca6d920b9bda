//! End-to-end flows through `FlowService` on the in-memory backends.

use anyhow::{Context, Result, bail};
use permesi_authflow::authflow::deps::{
    Dependencies, LoginIdType, OtpConfig, WindowRateLimiter,
};
use permesi_authflow::authflow::notify::BroadcastNotifier;
use permesi_authflow::authflow::session::{ResolvedSession, SessionOptions};
use permesi_authflow::authflow::store::MemoryStore;
use permesi_authflow::authflow::{
    DomainError, FlowConfig, FlowError, FlowReference, FlowService, FlowServiceConfig, FlowType,
    Registry, ServiceOutput,
};
use secrecy::SecretString;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

const CODE: &str = "111111";

struct Fixture {
    service: FlowService,
    deps: Dependencies,
}

impl Fixture {
    fn new() -> Result<Self> {
        Self::with_deps(Dependencies::in_memory(otp()))
    }

    fn with_deps(deps: Dependencies) -> Result<Self> {
        let service = FlowService::new(
            Arc::new(Registry::with_builtin_steps()?),
            deps.clone(),
            Arc::new(MemoryStore::default()),
            Arc::new(BroadcastNotifier::default()),
            FlowConfig::default(),
        )?
        .with_config(FlowServiceConfig::new().with_default_redirect_uri("/home"));
        Ok(Self { service, deps })
    }

    async fn create(&self, flow_type: FlowType) -> Result<ServiceOutput> {
        Ok(self
            .service
            .create_new_flow(&FlowReference::new(flow_type, "default"), session("ua"))
            .await?)
    }

    async fn feed(&self, output: &ServiceOutput, input: Value) -> Result<ServiceOutput> {
        Ok(self
            .service
            .feed_input(
                &output.workflow_id,
                Some(&output.instance_id),
                &input,
                Some("ua"),
            )
            .await?)
    }

    async fn user(&self, login_id: &str, password: &str) -> Result<String> {
        let user = self
            .deps
            .users
            .create_user(login_id, LoginIdType::Email, Some(password))
            .await?;
        Ok(user.id)
    }
}

fn otp() -> OtpConfig {
    OtpConfig::new().with_fixed_code(SecretString::from(CODE.to_string()))
}

fn session(user_agent_id: &str) -> ResolvedSession {
    ResolvedSession {
        options: SessionOptions::default(),
        user_agent_id: user_agent_id.to_string(),
        cookies: Vec::new(),
    }
}

fn identification(login_id: &str) -> Value {
    json!({
        "kind": "identification",
        "data": {"identification": "email", "login_id": login_id}
    })
}

fn code(code: &str) -> Value {
    json!({"kind": "verification_code", "data": {"code": code}})
}

fn new_password(password: &str) -> Value {
    json!({
        "kind": "new_authenticator",
        "data": {"authentication": "primary_password", "new_password": password}
    })
}

#[tokio::test]
async fn signup_creates_user_and_finishes() -> Result<()> {
    let fixture = Fixture::new()?;
    let created = fixture.create(FlowType::Signup).await?;
    assert_eq!(created.action.step, "identify");

    let verify = fixture
        .feed(&created, identification("New@Example.com"))
        .await?;
    assert_eq!(verify.action.step, "verify");
    assert_eq!(verify.action.accepts, vec!["verification_code", "resend_code"]);
    assert_eq!(verify.workflow_id, created.workflow_id);
    assert_ne!(verify.instance_id, created.instance_id);

    let create_password = fixture.feed(&verify, code(CODE)).await?;
    assert_eq!(create_password.action.step, "create_authenticator");

    let finished = fixture.feed(&create_password, new_password("pw")).await?;
    assert!(finished.finished);
    assert_eq!(finished.action.step, "finished");
    assert_eq!(finished.action.data["redirect_uri"], "/home");

    let user_id = finished.action.data["user_id"]
        .as_str()
        .context("missing user id")?;
    let user = fixture
        .deps
        .users
        .find_by_login_id("new@example.com")
        .await?
        .context("user was not created")?;
    assert_eq!(user.id, user_id);
    assert!(fixture.deps.users.verify_password(user_id, "pw").await?);
    Ok(())
}

#[tokio::test]
async fn finished_flow_ignores_further_input() -> Result<()> {
    let fixture = Fixture::new()?;
    let created = fixture.create(FlowType::Signup).await?;
    let finished = fixture
        .service
        .batch_input(
            &created.workflow_id,
            None,
            &[
                identification("a@example.com"),
                code(CODE),
                new_password("pw"),
            ],
            Some("ua"),
        )
        .await?;
    assert!(finished.finished);
    let before = fixture.service.store().read(&created.workflow_id).await?;

    let again = fixture.feed(&finished, new_password("other")).await?;
    assert!(again.finished);
    assert_eq!(again.instance_id, finished.instance_id);
    assert_eq!(again.action, finished.action);

    let after = fixture.service.store().read(&created.workflow_id).await?;
    assert_eq!(after.nodes.len(), before.nodes.len());
    assert_eq!(after.head(), before.head());
    Ok(())
}

#[tokio::test]
async fn wrong_input_kind_leaves_history_unchanged() -> Result<()> {
    let fixture = Fixture::new()?;
    let created = fixture.create(FlowType::Signup).await?;

    let err = match fixture
        .service
        .feed_input(&created.workflow_id, None, &code(CODE), Some("ua"))
        .await
    {
        Err(err) => err,
        Ok(output) => bail!("expected rejection, got {output:?}"),
    };
    assert_eq!(err.reason(), "InvalidInputKind");
    let state = err.state.context("error carries no state")?;
    assert_eq!(state.instance_id, created.instance_id);

    let current = fixture
        .service
        .get(&created.workflow_id, None, Some("ua"))
        .await?;
    assert_eq!(current.instance_id, created.instance_id);
    assert_eq!(current.action, created.action);
    Ok(())
}

#[tokio::test]
async fn unknown_input_kind_is_rejected() -> Result<()> {
    let fixture = Fixture::new()?;
    let created = fixture.create(FlowType::Signup).await?;
    let result = fixture
        .feed(&created, json!({"kind": "teleport", "data": {}}))
        .await;
    let err = result.err().context("expected an error")?;
    let err = err
        .downcast_ref::<permesi_authflow::authflow::ServiceError>()
        .context("unexpected error type")?;
    assert_eq!(err.reason(), "UnknownKind");
    Ok(())
}

#[tokio::test]
async fn stale_instance_conflicts() -> Result<()> {
    let fixture = Fixture::new()?;
    let created = fixture.create(FlowType::Signup).await?;
    fixture
        .feed(&created, identification("a@example.com"))
        .await?;

    let stale = fixture
        .service
        .feed_input(
            &created.workflow_id,
            Some(&created.instance_id),
            &identification("b@example.com"),
            Some("ua"),
        )
        .await;
    match stale {
        Err(err) => {
            assert!(matches!(err.error, FlowError::Conflict));
            assert!(err.state.is_none());
        }
        Ok(output) => bail!("expected conflict, got {output:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn reading_an_old_instance_replays_to_that_point() -> Result<()> {
    let fixture = Fixture::new()?;
    let created = fixture.create(FlowType::Signup).await?;
    let verify = fixture
        .feed(&created, identification("a@example.com"))
        .await?;

    let past = fixture
        .service
        .get(&created.workflow_id, Some(&created.instance_id), Some("ua"))
        .await?;
    assert_eq!(past.action.step, "identify");

    let first = fixture.service.get(&verify.workflow_id, None, Some("ua")).await?;
    let second = fixture.service.get(&verify.workflow_id, None, Some("ua")).await?;
    assert_eq!(first.instance_id, verify.instance_id);
    assert_eq!(first.action, second.action);
    Ok(())
}

#[tokio::test]
async fn wrong_code_keeps_flow_on_verify() -> Result<()> {
    let fixture = Fixture::new()?;
    let created = fixture.create(FlowType::Signup).await?;
    let verify = fixture
        .feed(&created, identification("a@example.com"))
        .await?;

    let err = match fixture
        .service
        .feed_input(&verify.workflow_id, None, &code("000000"), Some("ua"))
        .await
    {
        Err(err) => err,
        Ok(output) => bail!("expected invalid code, got {output:?}"),
    };
    assert!(matches!(
        err.error,
        FlowError::Domain(DomainError::InvalidCode)
    ));
    let state = err.state.context("error carries no state")?;
    assert_eq!(state.action.step, "verify");

    let next = fixture
        .service
        .feed_input(&verify.workflow_id, None, &code(CODE), Some("ua"))
        .await?;
    assert_eq!(next.action.step, "create_authenticator");
    Ok(())
}

#[tokio::test]
async fn batch_stops_at_first_error() -> Result<()> {
    let fixture = Fixture::new()?;
    let created = fixture.create(FlowType::Signup).await?;
    let result = fixture
        .service
        .batch_input(
            &created.workflow_id,
            None,
            &[
                identification("a@example.com"),
                code("000000"),
                new_password("pw"),
            ],
            Some("ua"),
        )
        .await;
    let err = result.err().context("expected an error")?;
    assert_eq!(err.reason(), "InvalidCode");
    let state = err.state.context("error carries no state")?;
    assert_eq!(state.action.step, "verify");
    Ok(())
}

#[tokio::test]
async fn create_with_batch_runs_inputs() -> Result<()> {
    let fixture = Fixture::new()?;
    let output = fixture
        .service
        .create_with_batch(
            &FlowReference::new(FlowType::Signup, "default"),
            session("ua"),
            &[identification("a@example.com"), code(CODE)],
        )
        .await?;
    assert_eq!(output.action.step, "create_authenticator");
    Ok(())
}

#[tokio::test]
async fn signup_rejects_existing_user() -> Result<()> {
    let fixture = Fixture::new()?;
    fixture.user("taken@example.com", "pw").await?;
    let created = fixture.create(FlowType::Signup).await?;
    let err = fixture
        .service
        .feed_input(
            &created.workflow_id,
            None,
            &identification("taken@example.com"),
            Some("ua"),
        )
        .await
        .err()
        .context("expected user exists")?;
    assert_eq!(err.reason(), "UserExists");
    Ok(())
}

#[tokio::test]
async fn login_with_password() -> Result<()> {
    let fixture = Fixture::new()?;
    let user_id = fixture.user("a@example.com", "secret").await?;
    let created = fixture.create(FlowType::Login).await?;

    let authenticate = fixture
        .feed(&created, identification("a@example.com"))
        .await?;
    assert_eq!(authenticate.action.step, "authenticate");

    let wrong = fixture
        .service
        .feed_input(
            &created.workflow_id,
            None,
            &json!({
                "kind": "authentication",
                "data": {"authentication": "primary_password", "password": "nope"}
            }),
            Some("ua"),
        )
        .await
        .err()
        .context("expected invalid credentials")?;
    assert_eq!(wrong.reason(), "InvalidCredentials");

    let finished = fixture
        .feed(
            &authenticate,
            json!({
                "kind": "authentication",
                "data": {"authentication": "primary_password", "password": "secret"}
            }),
        )
        .await?;
    assert!(finished.finished);
    assert_eq!(finished.action.data["user_id"], user_id);
    Ok(())
}

#[tokio::test]
async fn login_with_email_code() -> Result<()> {
    let fixture = Fixture::new()?;
    let user_id = fixture.user("a@example.com", "secret").await?;
    let created = fixture.create(FlowType::Login).await?;
    let authenticate = fixture
        .feed(&created, identification("a@example.com"))
        .await?;

    let verify = fixture
        .feed(
            &authenticate,
            json!({
                "kind": "authentication",
                "data": {"authentication": "primary_oob_otp_email"}
            }),
        )
        .await?;
    assert_eq!(verify.action.step, "verify");

    let finished = fixture.feed(&verify, code(CODE)).await?;
    assert!(finished.finished);
    assert_eq!(finished.action.data["user_id"], user_id);
    Ok(())
}

#[tokio::test]
async fn login_requires_existing_user() -> Result<()> {
    let fixture = Fixture::new()?;
    let created = fixture.create(FlowType::Login).await?;
    let err = fixture
        .service
        .feed_input(
            &created.workflow_id,
            None,
            &identification("ghost@example.com"),
            Some("ua"),
        )
        .await
        .err()
        .context("expected user not found")?;
    assert_eq!(err.reason(), "UserNotFound");
    Ok(())
}

#[tokio::test]
async fn account_recovery_resets_password() -> Result<()> {
    let fixture = Fixture::new()?;
    let user_id = fixture.user("a@example.com", "old").await?;
    let created = fixture.create(FlowType::AccountRecovery).await?;

    let finished = fixture
        .service
        .batch_input(
            &created.workflow_id,
            None,
            &[
                identification("a@example.com"),
                code(CODE),
                json!({"kind": "new_password", "data": {"new_password": "new"}}),
            ],
            Some("ua"),
        )
        .await?;
    assert!(finished.finished);
    assert!(fixture.deps.users.verify_password(&user_id, "new").await?);
    assert!(!fixture.deps.users.verify_password(&user_id, "old").await?);
    Ok(())
}

#[tokio::test]
async fn rate_limited_password_attempts() -> Result<()> {
    let deps = Dependencies::in_memory(otp())
        .with_rate_limiter(Arc::new(WindowRateLimiter::new(1, Duration::from_secs(60))));
    let fixture = Fixture::with_deps(deps)?;
    fixture.user("a@example.com", "secret").await?;
    let created = fixture.create(FlowType::Login).await?;
    fixture
        .feed(&created, identification("a@example.com"))
        .await?;

    let attempt = json!({
        "kind": "authentication",
        "data": {"authentication": "primary_password", "password": "nope"}
    });
    let first = fixture
        .service
        .feed_input(&created.workflow_id, None, &attempt, Some("ua"))
        .await
        .err()
        .context("expected invalid credentials")?;
    assert_eq!(first.reason(), "InvalidCredentials");

    let second = fixture
        .service
        .feed_input(&created.workflow_id, None, &attempt, Some("ua"))
        .await
        .err()
        .context("expected rate limit")?;
    assert_eq!(second.reason(), "RateLimited");
    Ok(())
}

#[tokio::test]
async fn unknown_workflow_is_not_found() -> Result<()> {
    let fixture = Fixture::new()?;
    let err = fixture
        .service
        .get("01J00000000000000000000000", None, None)
        .await
        .err()
        .context("expected not found")?;
    assert!(matches!(err.error, FlowError::NotFound));
    Ok(())
}

#[tokio::test]
async fn unknown_flow_name_is_rejected() -> Result<()> {
    let fixture = Fixture::new()?;
    let err = fixture
        .service
        .create_new_flow(
            &FlowReference::new(FlowType::Signup, "enterprise"),
            session("ua"),
        )
        .await
        .err()
        .context("expected unknown flow")?;
    assert!(matches!(err.error, FlowError::UnknownFlow(_)));
    Ok(())
}

#[tokio::test]
async fn appends_wake_subscribers() -> Result<()> {
    let fixture = Fixture::new()?;
    let created = fixture.create(FlowType::Signup).await?;
    let mut subscription = fixture.service.subscribe(&created.workflow_id);
    let mut other = fixture.service.subscribe("another-workflow");

    fixture
        .feed(&created, identification("a@example.com"))
        .await?;

    let woke = tokio::time::timeout(Duration::from_secs(1), subscription.changed()).await?;
    assert!(woke);
    assert!(
        tokio::time::timeout(Duration::from_millis(50), other.changed())
            .await
            .is_err()
    );
    Ok(())
}
