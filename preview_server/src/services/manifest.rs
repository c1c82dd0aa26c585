//! Validation of the application manifest (`porter.yaml`) on a repository branch.
//!
//! The checks are pure over the file bytes; fetching is a thin wrapper over
//! the source-control contents API.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_yaml::{Mapping, Value};

use super::github::{ScmError, ScmResult, SourceControl};
use crate::models::environment::RepoRef;

pub const MANIFEST_PATH: &str = "porter.yaml";
pub const MANIFEST_VERSION: &str = "v1stack";

static APP_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]{0,61}[a-z0-9])?$").unwrap());
static ENV_KEY_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.-]*$").unwrap());

const TOP_LEVEL_KEYS: &[&str] = &["version", "build", "apps", "release", "env"];
const BUILD_KEYS: &[&str] = &["method", "context", "dockerfile", "builder", "buildpacks", "image"];
const APP_KEYS: &[&str] = &["type", "run", "port", "replicas", "env", "build"];
const APP_TYPES: &[&str] = &["web", "worker", "job"];
const MAX_REPLICAS: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DefectCode {
    NoManifest,
    EmptyManifest,
    InvalidYaml,
    UnsupportedVersion,
    UnknownField,
    MissingField,
    InvalidValue,
}

impl DefectCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoManifest => "NO_MANIFEST",
            Self::EmptyManifest => "EMPTY_MANIFEST",
            Self::InvalidYaml => "INVALID_YAML",
            Self::UnsupportedVersion => "UNSUPPORTED_VERSION",
            Self::UnknownField => "UNKNOWN_FIELD",
            Self::MissingField => "MISSING_FIELD",
            Self::InvalidValue => "INVALID_VALUE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestDefect {
    pub code: DefectCode,
    pub message: String,
}

impl ManifestDefect {
    fn new(code: DefectCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ManifestDefect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            f.write_str(self.code.as_str())
        } else {
            write!(f, "{}: {}", self.code.as_str(), self.message)
        }
    }
}

/// Fetch the manifest from `branch` (default branch when `None`) and validate it.
pub async fn validate_branch(
    scm: &dyn SourceControl,
    repo: &RepoRef,
    branch: Option<&str>,
) -> ScmResult<Vec<ManifestDefect>> {
    match scm.get_contents(repo, MANIFEST_PATH, branch).await {
        Ok(file) => Ok(validate_manifest(&file.content)),
        Err(ScmError::NotFound(_)) => Ok(vec![ManifestDefect::new(DefectCode::NoManifest, "")]),
        Err(e) => Err(e),
    }
}

/// All defects found in the manifest bytes; empty means valid.
pub fn validate_manifest(bytes: &[u8]) -> Vec<ManifestDefect> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return vec![ManifestDefect::new(DefectCode::EmptyManifest, "")];
    }

    let doc: Value = match serde_yaml::from_slice(bytes) {
        Ok(doc) => doc,
        Err(e) => return vec![ManifestDefect::new(DefectCode::InvalidYaml, e.to_string())],
    };

    let root = match doc {
        Value::Mapping(root) => root,
        Value::Null => return vec![ManifestDefect::new(DefectCode::EmptyManifest, "")],
        _ => {
            return vec![ManifestDefect::new(
                DefectCode::InvalidYaml,
                "manifest must be a mapping at the top level",
            )]
        }
    };

    let mut defects = Vec::new();
    unknown_keys(&root, TOP_LEVEL_KEYS, "", &mut defects);

    match root.get("version") {
        None => defects.push(ManifestDefect::new(DefectCode::MissingField, "version is required")),
        Some(Value::String(v)) if v == MANIFEST_VERSION => {}
        Some(other) => defects.push(ManifestDefect::new(
            DefectCode::UnsupportedVersion,
            format!("version must be {MANIFEST_VERSION}, got {}", render(other)),
        )),
    }

    let top_build = root.get("build");
    if let Some(build) = top_build {
        check_build(build, "build", &mut defects);
    }

    if let Some(env) = root.get("env") {
        check_env(env, "env", &mut defects);
    }

    match root.get("apps") {
        None => defects.push(ManifestDefect::new(DefectCode::MissingField, "apps is required")),
        Some(Value::Mapping(apps)) if apps.is_empty() => {
            defects.push(ManifestDefect::new(DefectCode::InvalidValue, "apps must define at least one app"))
        }
        Some(Value::Mapping(apps)) => {
            for (name, app) in apps {
                check_app(name, app, top_build.is_some(), &mut defects);
            }
        }
        Some(_) => defects.push(ManifestDefect::new(DefectCode::InvalidValue, "apps must be a mapping")),
    }

    if let Some(release) = root.get("release") {
        match release {
            Value::Mapping(release) => {
                unknown_keys(release, &["run", "env"], "release", &mut defects);
                if !is_nonempty_string(release.get("run")) {
                    defects.push(ManifestDefect::new(DefectCode::MissingField, "release.run is required"));
                }
                if let Some(env) = release.get("env") {
                    check_env(env, "release.env", &mut defects);
                }
            }
            _ => defects.push(ManifestDefect::new(DefectCode::InvalidValue, "release must be a mapping")),
        }
    }

    defects
}

fn check_app(name: &Value, app: &Value, has_top_build: bool, defects: &mut Vec<ManifestDefect>) {
    let Some(name) = name.as_str() else {
        defects.push(ManifestDefect::new(DefectCode::InvalidValue, "app names must be strings"));
        return;
    };
    if !APP_NAME_REGEX.is_match(name) {
        defects.push(ManifestDefect::new(
            DefectCode::InvalidValue,
            format!("app name {name:?} must be a lowercase DNS label"),
        ));
    }

    let path = format!("apps.{name}");
    let Value::Mapping(app) = app else {
        defects.push(ManifestDefect::new(DefectCode::InvalidValue, format!("{path} must be a mapping")));
        return;
    };
    unknown_keys(app, APP_KEYS, &path, defects);

    let app_type = match app.get("type") {
        None => {
            defects.push(ManifestDefect::new(DefectCode::MissingField, format!("{path}.type is required")));
            None
        }
        Some(Value::String(t)) if APP_TYPES.contains(&t.as_str()) => Some(t.as_str()),
        Some(other) => {
            defects.push(ManifestDefect::new(
                DefectCode::InvalidValue,
                format!("{path}.type must be one of web, worker, job; got {}", render(other)),
            ));
            None
        }
    };

    if !is_nonempty_string(app.get("run")) {
        defects.push(ManifestDefect::new(DefectCode::MissingField, format!("{path}.run is required")));
    }

    match app.get("port") {
        Some(port) => match port.as_i64() {
            Some(p) if (1..=65535).contains(&p) => {
                if app_type == Some("job") {
                    defects.push(ManifestDefect::new(
                        DefectCode::InvalidValue,
                        format!("{path}.port is not allowed for jobs"),
                    ));
                }
            }
            _ => defects.push(ManifestDefect::new(
                DefectCode::InvalidValue,
                format!("{path}.port must be between 1 and 65535"),
            )),
        },
        None if app_type == Some("web") => {
            defects.push(ManifestDefect::new(DefectCode::MissingField, format!("{path}.port is required for web apps")))
        }
        None => {}
    }

    if let Some(replicas) = app.get("replicas") {
        match replicas.as_i64() {
            Some(r) if (0..=MAX_REPLICAS).contains(&r) => {}
            _ => defects.push(ManifestDefect::new(
                DefectCode::InvalidValue,
                format!("{path}.replicas must be between 0 and {MAX_REPLICAS}"),
            )),
        }
    }

    if let Some(env) = app.get("env") {
        check_env(env, &format!("{path}.env"), defects);
    }

    match app.get("build") {
        Some(build) => check_build(build, &format!("{path}.build"), defects),
        None if !has_top_build => defects.push(ManifestDefect::new(
            DefectCode::MissingField,
            format!("{path}.build is required when no top-level build is set"),
        )),
        None => {}
    }
}

fn check_build(build: &Value, path: &str, defects: &mut Vec<ManifestDefect>) {
    let Value::Mapping(build) = build else {
        defects.push(ManifestDefect::new(DefectCode::InvalidValue, format!("{path} must be a mapping")));
        return;
    };
    unknown_keys(build, BUILD_KEYS, path, defects);

    let require = |key: &str, method: &str, defects: &mut Vec<ManifestDefect>| {
        if !is_nonempty_string(build.get(key)) {
            defects.push(ManifestDefect::new(
                DefectCode::MissingField,
                format!("{path}.{key} is required for {method} builds"),
            ));
        }
    };

    match build.get("method").and_then(Value::as_str) {
        Some("pack") => require("builder", "pack", defects),
        Some("docker") => require("dockerfile", "docker", defects),
        Some("registry") => require("image", "registry", defects),
        Some(other) => defects.push(ManifestDefect::new(
            DefectCode::InvalidValue,
            format!("{path}.method must be one of pack, docker, registry; got {other:?}"),
        )),
        None => defects.push(ManifestDefect::new(DefectCode::MissingField, format!("{path}.method is required"))),
    }

    if let Some(buildpacks) = build.get("buildpacks") {
        let valid = buildpacks
            .as_sequence()
            .is_some_and(|packs| packs.iter().all(|p| is_nonempty_string(Some(p))));
        if !valid {
            defects.push(ManifestDefect::new(
                DefectCode::InvalidValue,
                format!("{path}.buildpacks must be a list of strings"),
            ));
        }
    }
}

fn check_env(env: &Value, path: &str, defects: &mut Vec<ManifestDefect>) {
    let Value::Mapping(env) = env else {
        defects.push(ManifestDefect::new(DefectCode::InvalidValue, format!("{path} must be a mapping")));
        return;
    };
    for (key, value) in env {
        match key.as_str() {
            Some(k) if ENV_KEY_REGEX.is_match(k) => {}
            _ => defects.push(ManifestDefect::new(
                DefectCode::InvalidValue,
                format!("{path} has invalid variable name {}", render(key)),
            )),
        }
        if matches!(value, Value::Mapping(_) | Value::Sequence(_)) {
            defects.push(ManifestDefect::new(
                DefectCode::InvalidValue,
                format!("{path}.{} must be a scalar", render(key)),
            ));
        }
    }
}

fn unknown_keys(map: &Mapping, allowed: &[&str], path: &str, defects: &mut Vec<ManifestDefect>) {
    for key in map.keys() {
        let known = key.as_str().is_some_and(|k| allowed.contains(&k));
        if !known {
            let field = if path.is_empty() {
                render(key)
            } else {
                format!("{path}.{}", render(key))
            };
            defects.push(ManifestDefect::new(DefectCode::UnknownField, format!("unknown field {field}")));
        }
    }
}

fn is_nonempty_string(value: Option<&Value>) -> bool {
    value.and_then(Value::as_str).is_some_and(|s| !s.trim().is_empty())
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        _ => "<complex value>".to_string(),
    }
}
