//! Resource-specific drivers that talk to the provider directly.
//!
//! A driver runs a fixed, ordered list of steps. The first failing step
//! aborts the run; steps that already succeeded stay applied. There is no
//! compensation: the error says what was completed so the user can decide.

use crate::credential_broker::TemporaryCredentials;
use crate::error::BridgeError;
use crate::executor::ApplyOutcome;
use crate::plan_generator::MANAGED_BY_TAG;
use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::types::{
    BucketLocationConstraint, BucketVersioningStatus, CreateBucketConfiguration,
    PublicAccessBlockConfiguration, ServerSideEncryption, ServerSideEncryptionByDefault,
    ServerSideEncryptionConfiguration, ServerSideEncryptionRule, Tag, Tagging, VersioningConfiguration,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};

/// Error returned by a single driver step.
#[derive(Debug, Clone)]
pub struct StepError {
    pub code: Option<String>,
    pub message: String,
}

impl StepError {
    pub fn new(code: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            code: code.map(str::to_string),
            message: message.into(),
        }
    }
}

fn from_sdk<E>(err: SdkError<E>) -> StepError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let code = err.as_service_error().and_then(|e| e.code()).map(str::to_string);
    StepError {
        code,
        message: DisplayErrorContext(&err).to_string(),
    }
}

/// Bucket configuration carried in a staged action.
#[derive(Debug, Clone, Deserialize)]
pub struct BucketSpec {
    pub bucket_name: String,
    pub region: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// The storage calls the bucket driver needs.
#[async_trait]
pub trait BucketApi: Send + Sync {
    async fn create_bucket(&self, spec: &BucketSpec) -> Result<(), StepError>;
    async fn enable_versioning(&self, bucket: &str) -> Result<(), StepError>;
    async fn enable_encryption(&self, bucket: &str) -> Result<(), StepError>;
    async fn block_public_access(&self, bucket: &str) -> Result<(), StepError>;
    async fn put_tags(&self, bucket: &str, tags: &BTreeMap<String, String>) -> Result<(), StepError>;
}

/// Opens a [`BucketApi`] session for a set of temporary credentials.
pub trait BucketConnector: Send + Sync {
    fn connect(&self, credentials: &TemporaryCredentials, region: &str) -> Arc<dyn BucketApi>;
}

/// [`BucketApi`] backed by the AWS S3 SDK.
pub struct S3BucketApi {
    client: aws_sdk_s3::Client,
}

/// Builds SDK clients that use only the assumed session.
pub struct S3Connector;

impl BucketConnector for S3Connector {
    fn connect(&self, credentials: &TemporaryCredentials, region: &str) -> Arc<dyn BucketApi> {
        let provider = Credentials::new(
            credentials.access_key_id.clone(),
            credentials.secret_access_key.clone(),
            Some(credentials.session_token.clone()),
            Some(credentials.expiration.into()),
            "skyward-assumed-role",
        );
        let conf = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .credentials_provider(provider)
            .build();
        Arc::new(S3BucketApi {
            client: aws_sdk_s3::Client::from_conf(conf),
        })
    }
}

fn build_error(err: impl std::fmt::Display) -> StepError {
    StepError::new(None, format!("invalid request: {}", err))
}

#[async_trait]
impl BucketApi for S3BucketApi {
    async fn create_bucket(&self, spec: &BucketSpec) -> Result<(), StepError> {
        let mut request = self.client.create_bucket().bucket(&spec.bucket_name);
        // us-east-1 rejects an explicit location constraint.
        if spec.region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(spec.region.as_str()))
                    .build(),
            );
        }
        request.send().await.map_err(from_sdk)?;
        Ok(())
    }

    async fn enable_versioning(&self, bucket: &str) -> Result<(), StepError> {
        self.client
            .put_bucket_versioning()
            .bucket(bucket)
            .versioning_configuration(
                VersioningConfiguration::builder()
                    .status(BucketVersioningStatus::Enabled)
                    .build(),
            )
            .send()
            .await
            .map_err(from_sdk)?;
        Ok(())
    }

    async fn enable_encryption(&self, bucket: &str) -> Result<(), StepError> {
        let default = ServerSideEncryptionByDefault::builder()
            .sse_algorithm(ServerSideEncryption::Aes256)
            .build()
            .map_err(build_error)?;
        let configuration = ServerSideEncryptionConfiguration::builder()
            .rules(
                ServerSideEncryptionRule::builder()
                    .apply_server_side_encryption_by_default(default)
                    .build(),
            )
            .build()
            .map_err(build_error)?;
        self.client
            .put_bucket_encryption()
            .bucket(bucket)
            .server_side_encryption_configuration(configuration)
            .send()
            .await
            .map_err(from_sdk)?;
        Ok(())
    }

    async fn block_public_access(&self, bucket: &str) -> Result<(), StepError> {
        self.client
            .put_public_access_block()
            .bucket(bucket)
            .public_access_block_configuration(
                PublicAccessBlockConfiguration::builder()
                    .block_public_acls(true)
                    .block_public_policy(true)
                    .ignore_public_acls(true)
                    .restrict_public_buckets(true)
                    .build(),
            )
            .send()
            .await
            .map_err(from_sdk)?;
        Ok(())
    }

    async fn put_tags(&self, bucket: &str, tags: &BTreeMap<String, String>) -> Result<(), StepError> {
        let tag_set = tags
            .iter()
            .map(|(k, v)| Tag::builder().key(k).value(v).build().map_err(build_error))
            .collect::<Result<Vec<_>, _>>()?;
        let tagging = Tagging::builder()
            .set_tag_set(Some(tag_set))
            .build()
            .map_err(build_error)?;
        self.client
            .put_bucket_tagging()
            .bucket(bucket)
            .tagging(tagging)
            .send()
            .await
            .map_err(from_sdk)?;
        Ok(())
    }
}

/// Ordered steps of the bucket driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketStep {
    Create,
    Versioning,
    Encryption,
    PublicAccessBlock,
    Tags,
}

impl BucketStep {
    pub const ORDER: [BucketStep; 5] = [
        BucketStep::Create,
        BucketStep::Versioning,
        BucketStep::Encryption,
        BucketStep::PublicAccessBlock,
        BucketStep::Tags,
    ];

    pub fn describe(&self) -> &'static str {
        match self {
            Self::Create => "create bucket",
            Self::Versioning => "enable versioning",
            Self::Encryption => "enable default encryption",
            Self::PublicAccessBlock => "block public access",
            Self::Tags => "apply tags",
        }
    }
}

/// Creates a storage bucket step by step.
pub struct S3BucketDriver {
    connector: Arc<dyn BucketConnector>,
}

impl S3BucketDriver {
    pub fn new(connector: Arc<dyn BucketConnector>) -> Self {
        Self { connector }
    }

    pub async fn provision(
        &self,
        config: &serde_json::Value,
        credentials: &TemporaryCredentials,
    ) -> Result<ApplyOutcome, BridgeError> {
        let mut spec: BucketSpec = serde_json::from_value(config.clone())
            .map_err(|e| BridgeError::internal(format!("Staged bucket configuration is invalid: {}", e)))?;
        spec.tags
            .entry(MANAGED_BY_TAG.0.to_string())
            .or_insert_with(|| MANAGED_BY_TAG.1.to_string());

        let api = self.connector.connect(credentials, &spec.region);
        let mut completed: Vec<BucketStep> = Vec::new();

        for step in BucketStep::ORDER {
            info!("Bucket {}: {}", spec.bucket_name, step.describe());
            let result = match step {
                BucketStep::Create => api.create_bucket(&spec).await,
                BucketStep::Versioning => api.enable_versioning(&spec.bucket_name).await,
                BucketStep::Encryption => api.enable_encryption(&spec.bucket_name).await,
                BucketStep::PublicAccessBlock => api.block_public_access(&spec.bucket_name).await,
                BucketStep::Tags => api.put_tags(&spec.bucket_name, &spec.tags).await,
            };
            if let Err(err) = result {
                error!("Bucket {} failed at '{}': {}", spec.bucket_name, step.describe(), err.message);
                return Err(step_failure(&spec, step, &completed, err));
            }
            completed.push(step);
        }

        let mut outputs = BTreeMap::new();
        outputs.insert("bucket_name".to_string(), spec.bucket_name.clone());
        outputs.insert("arn".to_string(), format!("arn:aws:s3:::{}", spec.bucket_name));
        outputs.insert("region".to_string(), spec.region.clone());
        outputs.insert("versioning".to_string(), "Enabled".to_string());
        outputs.insert("encryption".to_string(), "AES256".to_string());

        Ok(ApplyOutcome {
            resource_id: spec.bucket_name,
            outputs,
            workspace_id: None,
        })
    }
}

fn step_failure(spec: &BucketSpec, step: BucketStep, completed: &[BucketStep], err: StepError) -> BridgeError {
    let mut message = format!(
        "Failed to {} for bucket '{}': {}",
        step.describe(),
        spec.bucket_name,
        err.message
    );
    if completed.is_empty() {
        message.push_str("\nNo changes were made.");
    } else {
        let done: Vec<&str> = completed.iter().map(BucketStep::describe).collect();
        message.push_str(&format!(
            "\nCompleted before the failure: {}. These changes were NOT rolled back; the bucket may exist in a partially configured state.",
            done.join(", ")
        ));
    }

    match err.code.as_deref() {
        Some("BucketAlreadyExists") | Some("BucketAlreadyOwnedByYou") => BridgeError::provisioning_with_hint(
            message,
            "S3 bucket names are globally unique across all AWS accounts. Request the bucket again to get a new name.",
        ),
        Some("AccessDenied") => BridgeError::provisioning_with_hint(
            message,
            "The assumed role lacks the S3 permission for this step. Grant it in the role's policy and request the change again.",
        ),
        _ => BridgeError::provisioning(message),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Mutex;

    /// Records the order of calls and fails at a chosen step.
    #[derive(Default)]
    pub struct RecordingBucketApi {
        pub calls: Mutex<Vec<&'static str>>,
        pub fail_at: Option<(&'static str, Option<&'static str>)>,
        pub tags: Mutex<BTreeMap<String, String>>,
    }

    impl RecordingBucketApi {
        fn record(&self, name: &'static str) -> Result<(), StepError> {
            self.calls.lock().unwrap().push(name);
            match self.fail_at {
                Some((step, code)) if step == name => Err(StepError::new(code, format!("{} exploded", name))),
                _ => Ok(()),
            }
        }
    }

    #[async_trait]
    impl BucketApi for RecordingBucketApi {
        async fn create_bucket(&self, _spec: &BucketSpec) -> Result<(), StepError> {
            self.record("create")
        }
        async fn enable_versioning(&self, _bucket: &str) -> Result<(), StepError> {
            self.record("versioning")
        }
        async fn enable_encryption(&self, _bucket: &str) -> Result<(), StepError> {
            self.record("encryption")
        }
        async fn block_public_access(&self, _bucket: &str) -> Result<(), StepError> {
            self.record("public_access_block")
        }
        async fn put_tags(&self, _bucket: &str, tags: &BTreeMap<String, String>) -> Result<(), StepError> {
            *self.tags.lock().unwrap() = tags.clone();
            self.record("tags")
        }
    }

    pub struct FixedConnector(pub Arc<RecordingBucketApi>);

    impl BucketConnector for FixedConnector {
        fn connect(&self, _credentials: &TemporaryCredentials, _region: &str) -> Arc<dyn BucketApi> {
            self.0.clone()
        }
    }

    pub fn credentials() -> TemporaryCredentials {
        TemporaryCredentials {
            access_key_id: "ASIATEST".to_string(),
            secret_access_key: "test-secret-value".to_string(),
            session_token: "test-session-token".to_string(),
            expiration: Utc::now() + chrono::Duration::hours(1),
        }
    }

    fn config() -> serde_json::Value {
        json!({
            "bucket_name": "skyward-bucket-20260101000000-abcd",
            "region": "eu-west-1",
            "tags": { "Name": "skyward-bucket-20260101000000-abcd" },
        })
    }

    fn driver(api: &Arc<RecordingBucketApi>) -> S3BucketDriver {
        S3BucketDriver::new(Arc::new(FixedConnector(api.clone())))
    }

    #[tokio::test]
    async fn test_steps_run_in_order() {
        let api = Arc::new(RecordingBucketApi::default());

        let outcome = driver(&api).provision(&config(), &credentials()).await.unwrap();

        assert_eq!(
            *api.calls.lock().unwrap(),
            vec!["create", "versioning", "encryption", "public_access_block", "tags"]
        );
        assert_eq!(outcome.resource_id, "skyward-bucket-20260101000000-abcd");
        assert_eq!(outcome.outputs["arn"], "arn:aws:s3:::skyward-bucket-20260101000000-abcd");
        assert_eq!(api.tags.lock().unwrap()["managed-by"], "skyward");
    }

    #[tokio::test]
    async fn test_failure_aborts_without_rollback() {
        let api = Arc::new(RecordingBucketApi {
            fail_at: Some(("encryption", None)),
            ..Default::default()
        });

        let err = driver(&api).provision(&config(), &credentials()).await.unwrap_err();

        assert_eq!(*api.calls.lock().unwrap(), vec!["create", "versioning", "encryption"]);
        let message = err.to_string();
        assert!(message.contains("enable default encryption"));
        assert!(message.contains("create bucket, enable versioning"));
        assert!(message.contains("NOT rolled back"));
        assert_eq!(err.status_code(), 502);
    }

    #[tokio::test]
    async fn test_name_collision_adds_uniqueness_hint() {
        let api = Arc::new(RecordingBucketApi {
            fail_at: Some(("create", Some("BucketAlreadyExists"))),
            ..Default::default()
        });

        let err = driver(&api).provision(&config(), &credentials()).await.unwrap_err();

        assert_eq!(*api.calls.lock().unwrap(), vec!["create"]);
        assert!(err.hint().unwrap().contains("globally unique"));
        assert!(err.to_string().contains("No changes were made"));
    }

    #[tokio::test]
    async fn test_invalid_config_is_internal_error() {
        let api = Arc::new(RecordingBucketApi::default());

        let err = driver(&api)
            .provision(&json!({ "region": "us-east-1" }), &credentials())
            .await
            .unwrap_err();

        assert!(matches!(err, BridgeError::Internal(_)));
        assert!(api.calls.lock().unwrap().is_empty());
    }
}
