//! Cross-account role assumption.
//!
//! The broker is the trust-boundary primitive: it turns a validated
//! `(role ARN, external id)` pair into short-lived credentials or an identity
//! confirmation. Credentials it returns live only on the caller's stack.
//!
//! The remote identity service sits behind [`TrustProvider`] so the broker can
//! be exercised without network access.

use crate::error::BridgeError;
use crate::identity::{ExternalId, RoleArn, RoleReference};
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_sts::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Session lifetime used when only proving the trust relationship.
pub const VERIFY_DURATION: Duration = Duration::from_secs(900);
/// Session lifetime used before executing a staged action.
pub const EXECUTION_DURATION: Duration = Duration::from_secs(3600);

/// Short-lived credentials for an assumed role session.
///
/// Deliberately not `Serialize`; `Debug` never prints secrets.
#[derive(Clone)]
pub struct TemporaryCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expiration: DateTime<Utc>,
}

impl fmt::Debug for TemporaryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemporaryCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("expiration", &self.expiration)
            .finish()
    }
}

/// Outbound role-assumption call.
#[derive(Debug)]
pub struct AssumeRoleRequest<'a> {
    pub role_arn: &'a RoleArn,
    pub session_name: String,
    pub external_id: &'a ExternalId,
    pub duration_secs: u32,
}

/// Failure reported by a [`TrustProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    AccessDenied(String),
    Other(String),
}

/// The remote identity service.
#[async_trait]
pub trait TrustProvider: Send + Sync {
    /// Assumes the role and returns the session credentials.
    async fn assume_role(
        &self,
        request: &AssumeRoleRequest<'_>,
    ) -> Result<TemporaryCredentials, ProviderError>;

    /// Returns the account id the given session belongs to.
    async fn caller_identity(&self, credentials: &TemporaryCredentials) -> Result<String, ProviderError>;
}

/// [`TrustProvider`] backed by AWS STS.
///
/// The broker's own identity comes from the ambient AWS configuration chain;
/// every identity check uses only the assumed session.
pub struct StsTrustProvider {
    shared_config: SdkConfig,
    client: aws_sdk_sts::Client,
}

impl StsTrustProvider {
    pub async fn new(region: &str) -> Self {
        let shared_config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;
        let client = aws_sdk_sts::Client::new(&shared_config);
        Self {
            shared_config,
            client,
        }
    }

    fn session_client(&self, credentials: &TemporaryCredentials) -> aws_sdk_sts::Client {
        let provider = aws_sdk_sts::config::Credentials::new(
            credentials.access_key_id.clone(),
            credentials.secret_access_key.clone(),
            Some(credentials.session_token.clone()),
            Some(credentials.expiration.into()),
            "skyward-assumed-role",
        );
        let conf = aws_sdk_sts::config::Builder::from(&self.shared_config)
            .credentials_provider(provider)
            .build();
        aws_sdk_sts::Client::from_conf(conf)
    }
}

fn classify_sdk_error<E>(err: SdkError<E>) -> ProviderError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let code = err.as_service_error().and_then(|e| e.code()).map(str::to_string);
    let message = DisplayErrorContext(&err).to_string();
    match code.as_deref() {
        Some("AccessDenied") | Some("AccessDeniedException") => ProviderError::AccessDenied(message),
        _ => ProviderError::Other(message),
    }
}

#[async_trait]
impl TrustProvider for StsTrustProvider {
    async fn assume_role(
        &self,
        request: &AssumeRoleRequest<'_>,
    ) -> Result<TemporaryCredentials, ProviderError> {
        let output = self
            .client
            .assume_role()
            .role_arn(request.role_arn.as_str())
            .role_session_name(&request.session_name)
            .external_id(request.external_id.as_str())
            .duration_seconds(request.duration_secs as i32)
            .send()
            .await
            .map_err(classify_sdk_error)?;

        let creds = output
            .credentials()
            .ok_or_else(|| ProviderError::Other("AssumeRole returned no credentials".to_string()))?;
        let expiration = DateTime::from_timestamp(creds.expiration().secs(), 0)
            .ok_or_else(|| ProviderError::Other("AssumeRole returned an invalid expiration".to_string()))?;

        Ok(TemporaryCredentials {
            access_key_id: creds.access_key_id().to_string(),
            secret_access_key: creds.secret_access_key().to_string(),
            session_token: creds.session_token().to_string(),
            expiration,
        })
    }

    async fn caller_identity(&self, credentials: &TemporaryCredentials) -> Result<String, ProviderError> {
        let output = self
            .session_client(credentials)
            .get_caller_identity()
            .send()
            .await
            .map_err(classify_sdk_error)?;
        output
            .account()
            .map(str::to_string)
            .ok_or_else(|| ProviderError::Other("GetCallerIdentity returned no account".to_string()))
    }
}

/// Exchanges role references for credentials or identity confirmations.
///
/// No call is ever retried: trust failures are not transient, and retrying
/// them only amounts to credential probing.
pub struct CredentialBroker {
    provider: Arc<dyn TrustProvider>,
    verify_duration: Duration,
    execution_duration: Duration,
}

impl CredentialBroker {
    pub fn new(provider: Arc<dyn TrustProvider>) -> Self {
        Self {
            provider,
            verify_duration: VERIFY_DURATION,
            execution_duration: EXECUTION_DURATION,
        }
    }

    /// Overrides the session lifetimes (seconds) used for verify and execution.
    pub fn with_durations(mut self, verify_secs: u32, execution_secs: u32) -> Self {
        self.verify_duration = Duration::from_secs(verify_secs.into());
        self.execution_duration = Duration::from_secs(execution_secs.into());
        self
    }

    /// Proves the trust relationship and reports the account behind it.
    ///
    /// Input shape is checked first; the provider is not contacted for
    /// malformed input. The assumed credentials are dropped before returning.
    pub async fn verify(&self, role_arn: &str, external_id: &str) -> Result<RoleReference, BridgeError> {
        let role_arn = RoleArn::parse(role_arn)?;
        let external_id = ExternalId::parse(external_id)?;

        let credentials = self
            .assume_with_purpose(&role_arn, &external_id, self.verify_duration, "verify")
            .await?;
        let account_id = self
            .provider
            .caller_identity(&credentials)
            .await
            .map_err(|e| translate(&role_arn, e))?;
        drop(credentials);

        if account_id != role_arn.account_id() {
            warn!(
                "Assumed session for {} reports account {}",
                role_arn, account_id
            );
        }
        info!("Verified trust relationship for {}", role_arn);

        Ok(RoleReference {
            role_arn,
            external_id,
            account_id,
        })
    }

    /// Assumes the role for `duration`.
    pub async fn assume(
        &self,
        role_arn: &RoleArn,
        external_id: &ExternalId,
        duration: Duration,
    ) -> Result<TemporaryCredentials, BridgeError> {
        self.assume_with_purpose(role_arn, external_id, duration, "apply").await
    }

    /// Assumes the role with the execution-scoped lifetime.
    pub async fn assume_for_execution(
        &self,
        role_arn: &RoleArn,
        external_id: &ExternalId,
    ) -> Result<TemporaryCredentials, BridgeError> {
        self.assume(role_arn, external_id, self.execution_duration).await
    }

    async fn assume_with_purpose(
        &self,
        role_arn: &RoleArn,
        external_id: &ExternalId,
        duration: Duration,
        purpose: &str,
    ) -> Result<TemporaryCredentials, BridgeError> {
        let request = AssumeRoleRequest {
            role_arn,
            session_name: format!("skyward-{}-{}", purpose, Utc::now().timestamp_millis()),
            external_id,
            duration_secs: u32::try_from(duration.as_secs()).unwrap_or(u32::MAX),
        };
        info!(
            "Assuming {} for {} ({}s session)",
            role_arn, purpose, request.duration_secs
        );
        self.provider
            .assume_role(&request)
            .await
            .map_err(|e| translate(role_arn, e))
    }
}

fn translate(role_arn: &RoleArn, err: ProviderError) -> BridgeError {
    match err {
        ProviderError::AccessDenied(detail) => {
            warn!("Access denied assuming {}: {}", role_arn, detail);
            BridgeError::authorization(format!(
                "Access denied when assuming {}. Check that:\n\
                 - the role ARN is correct\n\
                 - the external id matches the sts:ExternalId condition in the role's trust policy\n\
                 - the trust policy allows this service's principal to call sts:AssumeRole",
                role_arn
            ))
        }
        ProviderError::Other(detail) => BridgeError::authorization(detail),
    }
}
