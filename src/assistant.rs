//! Request handlers tying the broker, planner, ledger and engine together.
//!
//! Each method maps to one inbound contract. Handlers hold no per-request
//! state; everything shared lives behind the injected `ActionLedger`.

use crate::action_ledger::ActionLedger;
use crate::config::{Config, Environment};
use crate::credential_broker::{CredentialBroker, TrustProvider};
use crate::error::BridgeError;
use crate::executor::ExecutionEngine;
use crate::identity::parse_credentials_pair;
use crate::plan_generator::PlanGenerator;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

// =============================================================================
// Knowledge base
// =============================================================================

/// Answers informational questions.
pub trait KnowledgeBase: Send + Sync {
    fn answer(&self, message: &str) -> Option<String>;
}

/// Fixed keyword lookup used when no richer knowledge source is wired in.
pub struct StaticKnowledgeBase;

const TOPICS: &[(&[&str], &str)] = &[
    (
        &["external id", "external-id", "externalid"],
        "An external id is a random secret you generate and place in your role's trust policy \
         (sts:ExternalId). Only someone holding it can assume the role on your behalf.",
    ),
    (
        &["role", "trust", "connect"],
        "To connect an account, create an IAM role that trusts this service, add your external id \
         as the sts:ExternalId condition, then share the role ARN.",
    ),
    (
        &["s3", "bucket"],
        "S3 buckets store objects. Buckets created here get versioning, default encryption and a \
         public access block.",
    ),
    (&["dynamo"], "DynamoDB is a serverless key-value and document database billed per request."),
    (&["sqs", "queue"], "SQS is a managed message queue for decoupling producers and consumers."),
    (&["cache", "redis", "elasticache"], "ElastiCache runs managed Redis clusters."),
    (&["lambda", "function"], "Lambda runs code without servers and bills per invocation."),
    (&["ec2", "instance", "server"], "EC2 provides virtual machines billed by the hour."),
];

const FALLBACK_ANSWER: &str = "I can answer questions about AWS services or set up resources for you. \
     Try \"create an s3 bucket\" or \"what is SQS?\".";

impl KnowledgeBase for StaticKnowledgeBase {
    fn answer(&self, message: &str) -> Option<String> {
        let lower = message.to_lowercase();
        TOPICS
            .iter()
            .find(|(keywords, _)| keywords.iter().any(|k| lower.contains(k)))
            .map(|(_, answer)| answer.to_string())
    }
}

// =============================================================================
// Response contracts
// =============================================================================

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VerifyRoleResponse {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ChatResponse {
    Informational {
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    ConfirmationRequired {
        requires_confirmation: bool,
        action_id: String,
        message: String,
        rendered_artifact: String,
        plan: String,
        resource_list: Vec<String>,
        cost_estimate: String,
        warnings: Vec<String>,
    },
    /// A change was requested without a role reference. Nothing is staged.
    #[serde(rename_all = "camelCase")]
    AuthorizationRequired {
        requires_authorization: bool,
        message: String,
    },
}

impl ChatResponse {
    pub fn message(&self) -> &str {
        match self {
            Self::Informational { message }
            | Self::ConfirmationRequired { message, .. }
            | Self::AuthorizationRequired { message, .. } => message,
        }
    }

    pub fn action_id(&self) -> Option<&str> {
        match self {
            Self::ConfirmationRequired { action_id, .. } => Some(action_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyResponse {
    pub success: bool,
    pub message: String,
    pub outputs: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
}

// =============================================================================
// Assistant
// =============================================================================

pub struct Assistant {
    ledger: Arc<ActionLedger>,
    broker: CredentialBroker,
    planner: PlanGenerator,
    engine: ExecutionEngine,
    knowledge: Box<dyn KnowledgeBase>,
    environment: Environment,
}

impl Assistant {
    pub fn new(
        ledger: Arc<ActionLedger>,
        broker: CredentialBroker,
        planner: PlanGenerator,
        engine: ExecutionEngine,
        knowledge: Box<dyn KnowledgeBase>,
        environment: Environment,
    ) -> Self {
        Self {
            ledger,
            broker,
            planner,
            engine,
            knowledge,
            environment,
        }
    }

    /// Wires the production collaborators from `config`.
    pub fn from_config(config: &Config, provider: Arc<dyn TrustProvider>, ledger: Arc<ActionLedger>) -> Self {
        Self::new(
            ledger,
            CredentialBroker::new(provider).with_durations(config.verify_duration_secs, config.apply_duration_secs),
            PlanGenerator::new(config.region.clone()).with_tool_timeout(config.tool_timeout()),
            ExecutionEngine::new(config),
            Box::new(StaticKnowledgeBase),
            config.environment,
        )
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// Confirms the trust relationship behind a role reference.
    ///
    /// Malformed input is an error; a rejected assumption is reported as
    /// `valid: false` with guidance.
    pub async fn verify_role(&self, role_arn: &str, external_id: &str) -> Result<VerifyRoleResponse, BridgeError> {
        match self.broker.verify(role_arn, external_id).await {
            Ok(reference) => Ok(VerifyRoleResponse {
                valid: true,
                account_id: Some(reference.account_id),
                error: None,
            }),
            Err(e @ BridgeError::Authorization(_)) => Ok(VerifyRoleResponse {
                valid: false,
                account_id: None,
                error: Some(e.public_message(self.environment)),
            }),
            Err(e) => Err(e),
        }
    }

    /// Answers a message, staging an action when it asks for a change.
    pub async fn chat(
        &self,
        message: &str,
        role_arn: Option<&str>,
        external_id: Option<&str>,
    ) -> Result<ChatResponse, BridgeError> {
        if !PlanGenerator::classify(message) {
            let answer = self
                .knowledge
                .answer(message)
                .unwrap_or_else(|| FALLBACK_ANSWER.to_string());
            return Ok(ChatResponse::Informational { message: answer });
        }

        let (role_arn, external_id) = match (non_empty(role_arn), non_empty(external_id)) {
            (Some(role_arn), Some(external_id)) => (role_arn, external_id),
            _ => {
                info!("Change requested without a connected role");
                return Ok(ChatResponse::AuthorizationRequired {
                    requires_authorization: true,
                    message: "Connect your AWS account first: provide a role ARN and the external id \
                              in its trust policy."
                        .to_string(),
                });
            }
        };

        let plan = self.planner.generate(message);
        if !plan.is_actionable() {
            return Ok(ChatResponse::Informational { message: plan.human_plan });
        }

        self.broker.verify(role_arn, external_id).await?;
        let action_id = self.ledger.stage(message, &plan)?;

        Ok(ChatResponse::ConfirmationRequired {
            requires_confirmation: true,
            message: format!(
                "Review the plan below. Confirm within {} minutes to apply it.",
                self.ledger.ttl().as_secs() / 60
            ),
            action_id,
            rendered_artifact: plan.rendered_artifact,
            plan: plan.human_plan,
            resource_list: plan.resource_list,
            cost_estimate: plan.cost_estimate,
            warnings: plan.warnings,
        })
    }

    /// Drops a staged action the user declined so it can no longer be applied.
    pub fn discard(&self, action_id: &str) -> bool {
        self.ledger.discard(action_id)
    }

    /// Executes a staged action with freshly assumed credentials.
    ///
    /// Provisioning failures come back as `success: false`; validation,
    /// lookup and authorization failures are errors.
    pub async fn apply(
        &self,
        action_id: &str,
        role_arn: &str,
        external_id: &str,
    ) -> Result<ApplyResponse, BridgeError> {
        let (role_arn, external_id) = parse_credentials_pair(role_arn, external_id)?;

        let action = self.ledger.consume(action_id)?;
        let credentials = self.broker.assume_for_execution(&role_arn, &external_id).await?;
        let result = self.engine.apply(&action, &credentials).await;
        drop(credentials);

        match result {
            Ok(outcome) => Ok(ApplyResponse {
                success: true,
                message: format!(
                    "✅ Created {} {}",
                    action.resource_type.label(),
                    outcome.resource_id
                ),
                outputs: outcome.outputs,
                resource_id: Some(outcome.resource_id),
            }),
            Err(e @ (BridgeError::Provisioning { .. } | BridgeError::Internal(_))) => {
                if matches!(e, BridgeError::Internal(_)) {
                    error!("Apply of {} failed: {}", action_id, e);
                } else {
                    warn!("Apply of {} failed: {}", action_id, e);
                }
                Ok(ApplyResponse {
                    success: false,
                    message: e.public_message(self.environment),
                    outputs: BTreeMap::new(),
                    resource_id: None,
                })
            }
            Err(e) => Err(e),
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action_ledger::DEFAULT_ACTION_TTL;
    use crate::credential_broker::tests::{ARN, MockTrustProvider, external_id};
    use crate::executor::SystemProcessRunner;
    use crate::resource_driver::tests::{FixedConnector, RecordingBucketApi};
    use std::time::Duration;

    struct Harness {
        assistant: Assistant,
        provider: Arc<MockTrustProvider>,
        bucket: Arc<RecordingBucketApi>,
        ledger: Arc<ActionLedger>,
        _root: tempfile::TempDir,
    }

    fn harness(provider: MockTrustProvider, environment: Environment) -> Harness {
        let root = tempfile::tempdir().unwrap();
        let provider = Arc::new(provider);
        let bucket = Arc::new(RecordingBucketApi::default());
        let ledger = Arc::new(ActionLedger::new(DEFAULT_ACTION_TTL));
        let engine = ExecutionEngine::with_deps(
            root.path().to_path_buf(),
            "skyward-no-such-terraform".to_string(),
            Duration::from_secs(5),
            Arc::new(SystemProcessRunner),
            Arc::new(FixedConnector(bucket.clone())),
        );
        let assistant = Assistant::new(
            ledger.clone(),
            CredentialBroker::new(provider.clone()),
            PlanGenerator::new("us-east-1"),
            engine,
            Box::new(StaticKnowledgeBase),
            environment,
        );
        Harness {
            assistant,
            provider,
            bucket,
            ledger,
            _root: root,
        }
    }

    fn trusting() -> Harness {
        harness(MockTrustProvider::trusting("123456789012"), Environment::Production)
    }

    // =========================================================================
    // verify_role
    // =========================================================================

    #[tokio::test]
    async fn test_verify_role_reports_account() {
        let h = trusting();
        let response = h.assistant.verify_role(ARN, &external_id()).await.unwrap();

        assert!(response.valid);
        assert_eq!(response.account_id.as_deref(), Some("123456789012"));
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn test_verify_role_denied_is_invalid_with_guidance() {
        let h = harness(MockTrustProvider::denying(), Environment::Production);
        let response = h.assistant.verify_role(ARN, &external_id()).await.unwrap();

        assert!(!response.valid);
        assert!(response.error.unwrap().contains("trust policy"));
    }

    #[tokio::test]
    async fn test_verify_role_malformed_is_error_without_calls() {
        let h = trusting();
        let err = h.assistant.verify_role("arn:aws:iam::1:role/x", &external_id()).await.unwrap_err();

        assert_eq!(err.status_code(), 400);
        assert_eq!(h.provider.calls(), 0);
    }

    #[test]
    fn test_verify_response_serializes_camel_case() {
        let response = VerifyRoleResponse {
            valid: true,
            account_id: Some("123456789012".to_string()),
            error: None,
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json, serde_json::json!({"valid": true, "accountId": "123456789012"}));
    }

    // =========================================================================
    // chat
    // =========================================================================

    #[tokio::test]
    async fn test_chat_question_is_informational() {
        let h = trusting();
        let response = h.assistant.chat("What is S3?", None, None).await.unwrap();

        assert!(matches!(response, ChatResponse::Informational { .. }));
        assert!(response.message().contains("S3"));
        assert!(h.ledger.is_empty());
        assert_eq!(h.provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_chat_unknown_question_uses_fallback() {
        let h = trusting();
        let response = h.assistant.chat("hello there", None, None).await.unwrap();
        assert_eq!(response.message(), FALLBACK_ANSWER);
    }

    #[tokio::test]
    async fn test_chat_change_without_role_requires_authorization() {
        let h = trusting();
        let response = h
            .assistant
            .chat("create an s3 bucket", Some(ARN), Some("  "))
            .await
            .unwrap();

        assert!(matches!(response, ChatResponse::AuthorizationRequired { .. }));
        assert!(h.ledger.is_empty());
        assert_eq!(h.provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_chat_change_stages_action() {
        let h = trusting();
        let response = h
            .assistant
            .chat("create an s3 bucket", Some(ARN), Some(&external_id()))
            .await
            .unwrap();

        match &response {
            ChatResponse::ConfirmationRequired {
                requires_confirmation,
                resource_list,
                cost_estimate,
                warnings,
                ..
            } => {
                assert!(requires_confirmation);
                assert!(!resource_list.is_empty());
                assert!(!cost_estimate.is_empty());
                assert!(!warnings.is_empty());
            }
            other => panic!("expected confirmation, got {:?}", other),
        }
        assert!(response.action_id().is_some());
        assert_eq!(h.ledger.len(), 1);
        assert!(response.message().contains("10 minutes"));
    }

    #[tokio::test]
    async fn test_chat_clarify_plan_is_informational() {
        let h = trusting();
        let response = h
            .assistant
            .chat("build me something nice", Some(ARN), Some(&external_id()))
            .await
            .unwrap();

        assert!(matches!(response, ChatResponse::Informational { .. }));
        assert!(h.ledger.is_empty());
    }

    #[tokio::test]
    async fn test_chat_malformed_role_is_rejected_before_calls() {
        let h = trusting();
        let err = h
            .assistant
            .chat("create an s3 bucket", Some(ARN), Some("ABCDEF"))
            .await
            .unwrap_err();

        assert!(matches!(err, BridgeError::Validation(_)));
        assert_eq!(h.provider.calls(), 0);
        assert!(h.ledger.is_empty());
    }

    #[tokio::test]
    async fn test_chat_denied_role_stages_nothing() {
        let h = harness(MockTrustProvider::denying(), Environment::Production);
        let err = h
            .assistant
            .chat("create an s3 bucket", Some(ARN), Some(&external_id()))
            .await
            .unwrap_err();

        assert_eq!(err.status_code(), 403);
        assert!(h.ledger.is_empty());
    }

    #[test]
    fn test_confirmation_serializes_camel_case() {
        let response = ChatResponse::ConfirmationRequired {
            requires_confirmation: true,
            action_id: "a".to_string(),
            message: "m".to_string(),
            rendered_artifact: "r".to_string(),
            plan: "p".to_string(),
            resource_list: vec!["x".to_string()],
            cost_estimate: "c".to_string(),
            warnings: vec![],
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["requiresConfirmation"], true);
        assert_eq!(json["actionId"], "a");
        assert_eq!(json["renderedArtifact"], "r");
        assert_eq!(json["costEstimate"], "c");
    }

    // =========================================================================
    // apply
    // =========================================================================

    async fn staged_bucket(h: &Harness) -> String {
        h.assistant
            .chat("create an s3 bucket", Some(ARN), Some(&external_id()))
            .await
            .unwrap()
            .action_id()
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn test_apply_runs_bucket_driver_with_fresh_credentials() {
        let h = trusting();
        let id = staged_bucket(&h).await;
        let before = h.provider.assume_calls.load(std::sync::atomic::Ordering::SeqCst);

        let response = h.assistant.apply(&id, ARN, &external_id()).await.unwrap();

        assert!(response.success, "{}", response.message);
        assert!(response.resource_id.unwrap().starts_with("skyward-"));
        assert_eq!(
            *h.bucket.calls.lock().unwrap(),
            vec!["create", "versioning", "encryption", "public_access_block", "tags"]
        );
        assert_eq!(h.provider.assume_calls.load(std::sync::atomic::Ordering::SeqCst), before + 1);
        assert_eq!(*h.provider.durations.lock().unwrap().last().unwrap(), 3600);
    }

    #[tokio::test]
    async fn test_apply_twice_is_not_found() {
        let h = trusting();
        let id = staged_bucket(&h).await;

        h.assistant.apply(&id, ARN, &external_id()).await.unwrap();
        let err = h.assistant.apply(&id, ARN, &external_id()).await.unwrap_err();

        assert!(matches!(err, BridgeError::NotFound));
    }

    #[tokio::test]
    async fn test_discarded_action_cannot_be_applied() {
        let h = trusting();
        let id = staged_bucket(&h).await;

        assert!(h.assistant.discard(&id));
        let err = h.assistant.apply(&id, ARN, &external_id()).await.unwrap_err();

        assert!(matches!(err, BridgeError::NotFound));
        assert!(h.bucket.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_apply_unknown_id_is_not_found_without_calls() {
        let h = trusting();
        let err = h.assistant.apply("missing", ARN, &external_id()).await.unwrap_err();

        assert_eq!(err.status_code(), 404);
        assert_eq!(h.provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_apply_malformed_input_keeps_action() {
        let h = trusting();
        let id = staged_bucket(&h).await;
        let calls = h.provider.calls();

        let err = h.assistant.apply(&id, "not-an-arn", &external_id()).await.unwrap_err();

        assert!(matches!(err, BridgeError::Validation(_)));
        assert_eq!(h.provider.calls(), calls);
        assert_eq!(h.ledger.len(), 1);
    }

    #[tokio::test]
    async fn test_apply_tool_failure_is_unsuccessful_response() {
        let h = trusting();
        let id = h
            .assistant
            .chat("create an sqs queue", Some(ARN), Some(&external_id()))
            .await
            .unwrap()
            .action_id()
            .unwrap()
            .to_string();

        let response = h.assistant.apply(&id, ARN, &external_id()).await.unwrap();

        assert!(!response.success);
        assert!(response.outputs.is_empty());
        assert!(response.message.contains("skyward-no-such-terraform"));
    }
}
