//! Rule-based plan generation.
//!
//! A request is matched against a closed, ordered rule table; the first rule
//! whose keywords appear in the message renders the plan. Nothing produced
//! here is executed directly: a plan only reaches the execution engine after
//! it has been staged and the user has confirmed it.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// Verbs that mark a message as a change request.
///
/// Matching is by substring, so "remake" or "builder" also count. That is
/// acceptable because nothing is touched before explicit confirmation.
pub const CHANGE_VERBS: &[&str] = &["create", "deploy", "setup", "build", "launch", "make", "provision"];

/// The closed set of resource types this system can provision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    S3Bucket,
    DynamoDbTable,
    SqsQueue,
    ElastiCacheCluster,
    LambdaFunction,
    Ec2Instance,
}

/// How a resource type is realized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStrategy {
    /// An ordered SDK driver talks to the provider directly.
    Driver,
    /// The rendered artifact is handed to the provisioning tool.
    Tool,
}

impl ResourceType {
    pub fn label(&self) -> &'static str {
        match self {
            Self::S3Bucket => "S3 bucket",
            Self::DynamoDbTable => "DynamoDB table",
            Self::SqsQueue => "SQS queue",
            Self::ElastiCacheCluster => "ElastiCache Redis cluster",
            Self::LambdaFunction => "Lambda function",
            Self::Ec2Instance => "EC2 instance",
        }
    }

    /// Upper end of the usual provisioning time, for slow resource types.
    pub fn typical_provisioning_time(&self) -> Option<Duration> {
        match self {
            Self::ElastiCacheCluster => Some(Duration::from_secs(600)),
            _ => None,
        }
    }

    pub fn strategy(&self) -> ExecutionStrategy {
        match self {
            Self::S3Bucket => ExecutionStrategy::Driver,
            _ => ExecutionStrategy::Tool,
        }
    }
}

/// A generated, not yet staged, change proposal.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    /// `None` when the request could not be matched to a resource.
    pub resource_type: Option<ResourceType>,
    pub resource_config: Value,
    pub rendered_artifact: String,
    pub human_plan: String,
    pub resource_list: Vec<String>,
    pub cost_estimate: String,
    pub warnings: Vec<String>,
}

impl Plan {
    fn clarify() -> Self {
        let options: Vec<String> = RULES
            .iter()
            .map(|rule| format!("- {} (e.g. \"create {}\")", rule.resource_type.label(), rule.example))
            .collect();
        Self {
            resource_type: None,
            resource_config: Value::Null,
            rendered_artifact: String::new(),
            human_plan: format!(
                "I couldn't tell which resource you want. I can set up:\n{}",
                options.join("\n")
            ),
            resource_list: Vec::new(),
            cost_estimate: String::new(),
            warnings: Vec::new(),
        }
    }

    /// True when the plan describes a concrete change.
    pub fn is_actionable(&self) -> bool {
        self.resource_type.is_some() && !self.resource_list.is_empty()
    }
}

/// One resource block as it appears in the human-readable plan.
struct PlannedResource {
    address: String,
    attributes: Vec<(&'static str, String)>,
}

impl PlannedResource {
    fn new(address: &str, attributes: Vec<(&'static str, String)>) -> Self {
        Self {
            address: address.to_string(),
            attributes,
        }
    }
}

/// Output of a rule's builder before the common rendering pass.
struct Draft {
    config: Value,
    artifact: String,
    resources: Vec<PlannedResource>,
    cost_estimate: String,
    warnings: Vec<String>,
}

struct Rule {
    resource_type: ResourceType,
    keywords: &'static [&'static str],
    example: &'static str,
    build: fn(&str, &str) -> Draft,
}

// Order matters: "serverless" must hit the Lambda rule before "server" hits EC2.
const RULES: &[Rule] = &[
    Rule {
        resource_type: ResourceType::S3Bucket,
        keywords: &["s3", "bucket", "storage"],
        example: "an s3 bucket",
        build: s3_bucket,
    },
    Rule {
        resource_type: ResourceType::DynamoDbTable,
        keywords: &["dynamo", "table", "database"],
        example: "a dynamodb table",
        build: dynamodb_table,
    },
    Rule {
        resource_type: ResourceType::SqsQueue,
        keywords: &["sqs", "queue"],
        example: "an sqs queue",
        build: sqs_queue,
    },
    Rule {
        resource_type: ResourceType::ElastiCacheCluster,
        keywords: &["cache", "redis"],
        example: "a redis cache",
        build: elasticache_cluster,
    },
    Rule {
        resource_type: ResourceType::LambdaFunction,
        keywords: &["lambda", "function", "serverless"],
        example: "a lambda function",
        build: lambda_function,
    },
    Rule {
        resource_type: ResourceType::Ec2Instance,
        keywords: &["ec2", "instance", "server", "vm"],
        example: "an ec2 instance",
        build: ec2_instance,
    },
];

/// Tag applied to everything this system creates.
pub const MANAGED_BY_TAG: (&str, &str) = ("managed-by", "skyward");

/// Default cap on a single provisioning tool run.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(300);

pub struct PlanGenerator {
    region: String,
    tool_timeout: Duration,
}

impl PlanGenerator {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
        }
    }

    /// Sets the provisioning timeout that plans are checked against.
    pub fn with_tool_timeout(mut self, tool_timeout: Duration) -> Self {
        self.tool_timeout = tool_timeout;
        self
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Returns true when the message asks for a change.
    pub fn classify(message: &str) -> bool {
        let lowered = message.to_lowercase();
        CHANGE_VERBS.iter().any(|verb| lowered.contains(verb))
    }

    /// Turns a request into a plan, or a clarify result if no rule matches.
    pub fn generate(&self, message: &str) -> Plan {
        let lowered = message.to_lowercase();
        let Some(rule) = RULES
            .iter()
            .find(|rule| rule.keywords.iter().any(|k| lowered.contains(k)))
        else {
            debug!("No plan rule matched request");
            return Plan::clarify();
        };

        let name = resource_name(name_kind(rule.resource_type));
        info!("Generating {} plan for '{}'", rule.resource_type.label(), name);
        let mut draft = (rule.build)(&name, &self.region);
        if let Some(expected) = rule.resource_type.typical_provisioning_time() {
            if expected > self.tool_timeout {
                draft.warnings.push(format!(
                    "Provisioning can take up to {} minutes, but runs are stopped after {} seconds. \
                     Raise tool_timeout_secs to at least {} or the apply will time out with the \
                     resource partially created.",
                    expected.as_secs() / 60,
                    self.tool_timeout.as_secs(),
                    expected.as_secs() + 300
                ));
            }
        }

        Plan {
            resource_type: Some(rule.resource_type),
            resource_config: draft.config,
            rendered_artifact: draft.artifact,
            human_plan: render_human_plan(&draft.resources),
            resource_list: draft.resources.iter().map(|r| r.address.clone()).collect(),
            cost_estimate: draft.cost_estimate,
            warnings: draft.warnings,
        }
    }
}

fn name_kind(resource_type: ResourceType) -> &'static str {
    match resource_type {
        ResourceType::S3Bucket => "bucket",
        ResourceType::DynamoDbTable => "table",
        ResourceType::SqsQueue => "queue",
        ResourceType::ElastiCacheCluster => "cache",
        ResourceType::LambdaFunction => "fn",
        ResourceType::Ec2Instance => "vm",
    }
}

static NAME_SEQUENCE: AtomicU32 = AtomicU32::new(0);

/// Time-derived name, valid for every supported type (at most 40 chars).
///
/// The suffix is a per-process sequence number followed by random bits, so
/// names generated by one process never repeat within a second.
fn resource_name(kind: &str) -> String {
    let sequence = NAME_SEQUENCE.fetch_add(1, Ordering::Relaxed) & 0xffff;
    format!(
        "skyward-{}-{}-{:04x}{:04x}",
        kind,
        Utc::now().format("%Y%m%d%H%M%S"),
        sequence,
        rand::random::<u16>()
    )
}

fn render_human_plan(resources: &[PlannedResource]) -> String {
    let mut out = String::from("Skyward will perform the following actions:\n");
    for resource in resources {
        out.push_str(&format!("\n  + {}\n", resource.address));
        for (key, value) in &resource.attributes {
            out.push_str(&format!("      {:<24} = {}\n", key, value));
        }
    }
    out.push_str(&format!(
        "\nPlan: {} to add, 0 to change, 0 to destroy.",
        resources.len()
    ));
    out
}

fn tags_block(name: &str) -> String {
    format!(
        "  tags = {{\n    Name         = \"{}\"\n    \"{}\" = \"{}\"\n  }}",
        name, MANAGED_BY_TAG.0, MANAGED_BY_TAG.1
    )
}

fn quoted(value: &str) -> String {
    format!("\"{}\"", value)
}

fn s3_bucket(name: &str, region: &str) -> Draft {
    let artifact = format!(
        r#"resource "aws_s3_bucket" "main" {{
  bucket = "{name}"
{tags}
}}

resource "aws_s3_bucket_versioning" "main" {{
  bucket = aws_s3_bucket.main.id
  versioning_configuration {{
    status = "Enabled"
  }}
}}

resource "aws_s3_bucket_server_side_encryption_configuration" "main" {{
  bucket = aws_s3_bucket.main.id
  rule {{
    apply_server_side_encryption_by_default {{
      sse_algorithm = "AES256"
    }}
  }}
}}

resource "aws_s3_bucket_public_access_block" "main" {{
  bucket                  = aws_s3_bucket.main.id
  block_public_acls       = true
  block_public_policy     = true
  ignore_public_acls      = true
  restrict_public_buckets = true
}}

output "id" {{
  value = aws_s3_bucket.main.id
}}

output "arn" {{
  value = aws_s3_bucket.main.arn
}}
"#,
        name = name,
        tags = tags_block(name)
    );

    Draft {
        config: json!({
            "bucket_name": name,
            "region": region,
            "versioning": true,
            "encryption": "AES256",
            "block_public_access": true,
            "tags": { "Name": name, "managed-by": "skyward" },
        }),
        artifact,
        resources: vec![
            PlannedResource::new("aws_s3_bucket.main", vec![("bucket", quoted(name)), ("region", quoted(region))]),
            PlannedResource::new("aws_s3_bucket_versioning.main", vec![("status", quoted("Enabled"))]),
            PlannedResource::new(
                "aws_s3_bucket_server_side_encryption_configuration.main",
                vec![("sse_algorithm", quoted("AES256"))],
            ),
            PlannedResource::new(
                "aws_s3_bucket_public_access_block.main",
                vec![("block_public_acls", "true".into()), ("restrict_public_buckets", "true".into())],
            ),
        ],
        cost_estimate: "~$0.023 per GB-month stored plus request charges; an empty bucket costs nothing."
            .to_string(),
        warnings: vec![
            "Bucket names are globally unique across all AWS accounts; creation fails if the name is taken.".to_string(),
            "Versioning keeps every object version, which increases storage costs over time.".to_string(),
            "Deleting the bucket later requires removing all object versions first.".to_string(),
        ],
    }
}

fn dynamodb_table(name: &str, region: &str) -> Draft {
    let artifact = format!(
        r#"resource "aws_dynamodb_table" "main" {{
  name         = "{name}"
  billing_mode = "PAY_PER_REQUEST"
  hash_key     = "id"

  attribute {{
    name = "id"
    type = "S"
  }}

  point_in_time_recovery {{
    enabled = true
  }}

  server_side_encryption {{
    enabled = true
  }}

{tags}
}}

output "id" {{
  value = aws_dynamodb_table.main.id
}}

output "arn" {{
  value = aws_dynamodb_table.main.arn
}}
"#,
        name = name,
        tags = tags_block(name)
    );

    Draft {
        config: json!({
            "table_name": name,
            "region": region,
            "billing_mode": "PAY_PER_REQUEST",
            "hash_key": "id",
            "point_in_time_recovery": true,
        }),
        artifact,
        resources: vec![PlannedResource::new(
            "aws_dynamodb_table.main",
            vec![
                ("name", quoted(name)),
                ("billing_mode", quoted("PAY_PER_REQUEST")),
                ("hash_key", quoted("id")),
            ],
        )],
        cost_estimate: "On-demand: ~$1.25 per million writes and ~$0.25 per million reads, plus $0.25 per GB-month."
            .to_string(),
        warnings: vec![
            "The partition key (id) cannot be changed after creation.".to_string(),
            "Point-in-time recovery adds ~$0.20 per GB-month.".to_string(),
        ],
    }
}

fn sqs_queue(name: &str, region: &str) -> Draft {
    let artifact = format!(
        r#"resource "aws_sqs_queue" "main" {{
  name                      = "{name}"
  message_retention_seconds = 345600
  visibility_timeout_seconds = 30
  sqs_managed_sse_enabled   = true
{tags}
}}

output "id" {{
  value = aws_sqs_queue.main.id
}}

output "arn" {{
  value = aws_sqs_queue.main.arn
}}
"#,
        name = name,
        tags = tags_block(name)
    );

    Draft {
        config: json!({
            "queue_name": name,
            "region": region,
            "message_retention_seconds": 345600,
            "visibility_timeout_seconds": 30,
        }),
        artifact,
        resources: vec![PlannedResource::new(
            "aws_sqs_queue.main",
            vec![("name", quoted(name)), ("message_retention_seconds", "345600".into())],
        )],
        cost_estimate: "First 1 million requests per month free, then ~$0.40 per million requests.".to_string(),
        warnings: vec![
            "Messages older than 4 days are deleted automatically.".to_string(),
            "This is a standard queue: ordering is best-effort and delivery is at-least-once.".to_string(),
        ],
    }
}

fn elasticache_cluster(name: &str, region: &str) -> Draft {
    let artifact = format!(
        r#"resource "aws_elasticache_cluster" "main" {{
  cluster_id      = "{name}"
  engine          = "redis"
  node_type       = "cache.t3.micro"
  num_cache_nodes = 1
  port            = 6379
{tags}
}}

output "id" {{
  value = aws_elasticache_cluster.main.id
}}

output "arn" {{
  value = aws_elasticache_cluster.main.arn
}}
"#,
        name = name,
        tags = tags_block(name)
    );

    Draft {
        config: json!({
            "cluster_id": name,
            "region": region,
            "engine": "redis",
            "node_type": "cache.t3.micro",
            "num_cache_nodes": 1,
        }),
        artifact,
        resources: vec![PlannedResource::new(
            "aws_elasticache_cluster.main",
            vec![
                ("cluster_id", quoted(name)),
                ("engine", quoted("redis")),
                ("node_type", quoted("cache.t3.micro")),
            ],
        )],
        cost_estimate: "~$12.41 per month for one cache.t3.micro node running continuously.".to_string(),
        warnings: vec![
            "The cluster is created in the default VPC and is not reachable from the internet.".to_string(),
            "A single node has no replica; data is lost if the node fails.".to_string(),
            "Provisioning usually takes 5-10 minutes.".to_string(),
        ],
    }
}

fn lambda_function(name: &str, region: &str) -> Draft {
    let artifact = format!(
        r#"data "archive_file" "handler" {{
  type        = "zip"
  output_path = "${{path.module}}/handler.zip"

  source {{
    filename = "handler.py"
    content  = "def handler(event, context):\n    return {{\"statusCode\": 200, \"body\": \"hello from skyward\"}}\n"
  }}
}}

resource "aws_iam_role" "execution" {{
  name = "{name}-role"
  assume_role_policy = jsonencode({{
    Version = "2012-10-17"
    Statement = [{{
      Effect    = "Allow"
      Principal = {{ Service = "lambda.amazonaws.com" }}
      Action    = "sts:AssumeRole"
    }}]
  }})
{tags}
}}

resource "aws_iam_role_policy_attachment" "logs" {{
  role       = aws_iam_role.execution.name
  policy_arn = "arn:aws:iam::aws:policy/service-role/AWSLambdaBasicExecutionRole"
}}

resource "aws_lambda_function" "main" {{
  function_name    = "{name}"
  role             = aws_iam_role.execution.arn
  runtime          = "python3.12"
  handler          = "handler.handler"
  filename         = data.archive_file.handler.output_path
  source_code_hash = data.archive_file.handler.output_base64sha256
  memory_size      = 128
  timeout          = 10
{tags}
}}

output "id" {{
  value = aws_lambda_function.main.id
}}

output "arn" {{
  value = aws_lambda_function.main.arn
}}
"#,
        name = name,
        tags = tags_block(name)
    );

    Draft {
        config: json!({
            "function_name": name,
            "region": region,
            "runtime": "python3.12",
            "memory_size": 128,
            "timeout": 10,
        }),
        artifact,
        resources: vec![
            PlannedResource::new("aws_iam_role.execution", vec![("name", quoted(&format!("{}-role", name)))]),
            PlannedResource::new(
                "aws_iam_role_policy_attachment.logs",
                vec![("policy_arn", quoted("AWSLambdaBasicExecutionRole"))],
            ),
            PlannedResource::new(
                "aws_lambda_function.main",
                vec![("function_name", quoted(name)), ("runtime", quoted("python3.12"))],
            ),
        ],
        cost_estimate: "First 1 million requests and 400,000 GB-seconds per month free, then ~$0.20 per million requests."
            .to_string(),
        warnings: vec![
            "An IAM role is created for the function; the assumed role must allow iam:CreateRole.".to_string(),
            "The function is deployed with a placeholder handler that you will want to replace.".to_string(),
        ],
    }
}

fn ec2_instance(name: &str, region: &str) -> Draft {
    let artifact = format!(
        r#"data "aws_ami" "al2023" {{
  most_recent = true
  owners      = ["amazon"]

  filter {{
    name   = "name"
    values = ["al2023-ami-*-x86_64"]
  }}
}}

resource "aws_instance" "main" {{
  ami           = data.aws_ami.al2023.id
  instance_type = "t3.micro"

  metadata_options {{
    http_tokens = "required"
  }}

  root_block_device {{
    encrypted = true
  }}

{tags}
}}

output "id" {{
  value = aws_instance.main.id
}}

output "arn" {{
  value = aws_instance.main.arn
}}
"#,
        tags = tags_block(name)
    );

    Draft {
        config: json!({
            "instance_name": name,
            "region": region,
            "instance_type": "t3.micro",
            "ami": "al2023-ami-*-x86_64",
        }),
        artifact,
        resources: vec![PlannedResource::new(
            "aws_instance.main",
            vec![
                ("instance_type", quoted("t3.micro")),
                ("ami", quoted("latest Amazon Linux 2023")),
                ("tags.Name", quoted(name)),
            ],
        )],
        cost_estimate: "~$7.59 per month for a t3.micro running continuously, plus ~$0.80 for 8 GB of gp3 storage."
            .to_string(),
        warnings: vec![
            "The instance launches in the default VPC with the default security group.".to_string(),
            "No SSH key pair is attached; use Session Manager to connect.".to_string(),
            "The instance keeps accruing charges until it is terminated.".to_string(),
        ],
    }
}
