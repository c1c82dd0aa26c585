//! The preview workflow committed into bound repositories, and the service
//! token it authenticates with.

use std::collections::BTreeMap;

use chrono::Utc;
use jsonwebtoken::{EncodingKey, Header};
use serde::{Deserialize, Serialize};

pub const WORKFLOW_DIR: &str = ".github/workflows";
pub const PREVIEW_ACTION: &str = "porter-dev/porter-preview-action@v0.2.1";

/// Repository path of an environment's workflow file.
pub fn workflow_path(file_name: &str) -> String {
    format!("{WORKFLOW_DIR}/{file_name}")
}

/// Name of the repository secret holding the service token.
pub fn secret_name(project_id: i64, cluster_id: i64) -> String {
    format!("PREVIEW_TOKEN_{project_id}_{cluster_id}")
}

#[derive(Debug, Clone)]
pub struct WorkflowParams<'a> {
    pub server_url: &'a str,
    pub project_id: i64,
    pub cluster_id: i64,
    pub installation_id: i64,
    pub repo_owner: &'a str,
    pub repo_name: &'a str,
    pub env_name: &'a str,
}

#[derive(Debug, Serialize, Deserialize)]
struct Workflow {
    name: String,
    #[serde(rename = "on")]
    trigger: Trigger,
    concurrency: Concurrency,
    jobs: BTreeMap<String, Job>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Trigger {
    workflow_dispatch: Dispatch,
}

#[derive(Debug, Serialize, Deserialize)]
struct Dispatch {
    inputs: BTreeMap<String, Input>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Input {
    description: String,
    required: bool,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Concurrency {
    group: String,
    #[serde(rename = "cancel-in-progress")]
    cancel_in_progress: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct Job {
    #[serde(rename = "runs-on")]
    runs_on: String,
    steps: Vec<Step>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Step {
    name: String,
    uses: String,
    #[serde(rename = "timeout-minutes", skip_serializing_if = "Option::is_none")]
    timeout_minutes: Option<u32>,
    #[serde(rename = "with", skip_serializing_if = "BTreeMap::is_empty", default)]
    with: BTreeMap<String, String>,
}

fn input_ref(name: &str) -> String {
    format!("${{{{ github.event.inputs.{name} }}}}")
}

fn dispatch_input(description: &str) -> Input {
    Input {
        description: description.to_string(),
        required: true,
        kind: "string".to_string(),
    }
}

/// YAML for the environment's `workflow_dispatch` workflow.
pub fn render_workflow(params: &WorkflowParams<'_>) -> Result<String, serde_yaml::Error> {
    let inputs = BTreeMap::from([
        ("pr_number".to_string(), dispatch_input("Pull request number")),
        ("pr_title".to_string(), dispatch_input("Pull request title")),
        ("pr_branch_from".to_string(), dispatch_input("Pull request head branch")),
        ("pr_branch_into".to_string(), dispatch_input("Pull request base branch")),
    ]);

    let with = BTreeMap::from([
        ("action_id".to_string(), "${{ github.run_id }}".to_string()),
        ("host".to_string(), params.server_url.trim_end_matches('/').to_string()),
        ("project".to_string(), params.project_id.to_string()),
        ("cluster".to_string(), params.cluster_id.to_string()),
        ("installation_id".to_string(), params.installation_id.to_string()),
        ("repo_owner".to_string(), params.repo_owner.to_string()),
        ("repo_name".to_string(), params.repo_name.to_string()),
        (
            "namespace".to_string(),
            format!("pr-{}-{}", input_ref("pr_number"), params.repo_name.to_lowercase()),
        ),
        ("pr_id".to_string(), input_ref("pr_number")),
        ("pr_name".to_string(), input_ref("pr_title")),
        ("pr_branch_from".to_string(), input_ref("pr_branch_from")),
        ("pr_branch_into".to_string(), input_ref("pr_branch_into")),
        (
            "token".to_string(),
            format!(
                "${{{{ secrets.{} }}}}",
                secret_name(params.project_id, params.cluster_id)
            ),
        ),
    ]);

    let workflow = Workflow {
        name: format!("Preview environment ({})", params.env_name),
        trigger: Trigger {
            workflow_dispatch: Dispatch { inputs },
        },
        concurrency: Concurrency {
            group: format!("${{{{ github.workflow }}}}-{}", input_ref("pr_number")),
            cancel_in_progress: false,
        },
        jobs: BTreeMap::from([(
            "porter-preview".to_string(),
            Job {
                runs_on: "ubuntu-latest".to_string(),
                steps: vec![
                    Step {
                        name: "Checkout code".to_string(),
                        uses: "actions/checkout@v4".to_string(),
                        timeout_minutes: None,
                        with: BTreeMap::new(),
                    },
                    Step {
                        name: "Create preview environment".to_string(),
                        uses: PREVIEW_ACTION.to_string(),
                        timeout_minutes: Some(30),
                        with,
                    },
                ],
            },
        )]),
    };

    serde_yaml::to_string(&workflow)
}

/// Claims of the token CI uses to call back into the controller.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceTokenClaims {
    pub sub: String,
    pub project_id: i64,
    pub cluster_id: i64,
    pub iat: i64,
}

/// HS256 service token scoped to a user and project.
pub fn mint_service_token(
    signing_key: &str,
    user_id: &str,
    project_id: i64,
    cluster_id: i64,
) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = ServiceTokenClaims {
        sub: user_id.to_string(),
        project_id,
        cluster_id,
        iat: Utc::now().timestamp(),
    };
    jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(signing_key.as_bytes()),
    )
}
