// ABOUTME: Job value type parsed and validated from the coordinator's wire payload
// ABOUTME: Coerces env values to strings and resolves the image source variant

use std::collections::HashMap;
use std::path::PathBuf;

use serde_json::Value;
use thiserror::Error;

/// Why a job payload was rejected.
#[derive(Debug, Error)]
pub enum JobErrorKind {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("field `{0}` has the wrong type")]
    WrongType(&'static str),
}

/// A rejected job payload.
///
/// Carries the payload's `secret` when one was present so the caller can
/// still report the failure to the coordinator. Without a secret there is
/// nowhere to post status and the payload can only be dropped.
#[derive(Debug, Error)]
#[error("invalid job payload: {kind}")]
pub struct JobError {
    secret: Option<String>,
    kind: JobErrorKind,
}

impl JobError {
    fn new(secret: Option<&str>, kind: JobErrorKind) -> Self {
        Self {
            secret: secret.map(|s| s.to_string()),
            kind,
        }
    }

    /// The payload's secret, if it carried one.
    pub fn secret(&self) -> Option<&str> {
        self.secret.as_deref()
    }
}

/// Repository coordinates for the per-job clone.
#[derive(Debug, Clone)]
pub struct Repository {
    pub origin: String,
    pub branch: String,
    pub commit: String,
    /// SSH deploy keys used for the clone, if the repository needs them.
    pub private_keys: Vec<PathBuf>,
}

/// Where the container image comes from: a content fingerprint or an alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Fingerprint(String),
    Alias(String),
}

/// One validated unit of work. Immutable after [`parse`].
#[derive(Debug, Clone)]
pub struct Job {
    /// Opaque correlation id; also seeds the container name and keys the
    /// per-job clone directory.
    pub secret: String,
    pub commands: Vec<String>,
    pub after_failure: Vec<String>,
    pub image: String,
    pub env: HashMap<String, String>,
    pub repository: Repository,
}

impl Job {
    pub fn image_source(&self) -> ImageSource {
        match self.image.strip_prefix("fingerprint:") {
            Some(fingerprint) => ImageSource::Fingerprint(fingerprint.to_string()),
            None => ImageSource::Alias(self.image.clone()),
        }
    }
}

/// Parse and validate a raw job payload.
///
/// `secret`, `commands`, `image`, and the repository coordinates are
/// required; `after_failure` and `env` are optional. Env values may be any
/// JSON scalar and are coerced to strings here, once.
pub fn parse(raw: &Value) -> Result<Job, JobError> {
    let secret = match raw.get("secret") {
        Some(Value::String(secret)) => secret.as_str(),
        Some(_) => return Err(JobError::new(None, JobErrorKind::WrongType("secret"))),
        None => return Err(JobError::new(None, JobErrorKind::MissingField("secret"))),
    };

    let commands = string_list(raw, "commands", secret)?
        .ok_or_else(|| JobError::new(Some(secret), JobErrorKind::MissingField("commands")))?;
    let after_failure = string_list(raw, "after_failure", secret)?.unwrap_or_default();

    let image = match raw.get("image") {
        Some(Value::String(image)) => image.clone(),
        Some(_) => return Err(JobError::new(Some(secret), JobErrorKind::WrongType("image"))),
        None => return Err(JobError::new(Some(secret), JobErrorKind::MissingField("image"))),
    };

    let env = match raw.get("env") {
        Some(Value::Object(entries)) => {
            let mut env = HashMap::with_capacity(entries.len());
            for (key, value) in entries {
                env.insert(key.clone(), coerce_env_value(value, secret)?);
            }
            env
        }
        Some(_) => return Err(JobError::new(Some(secret), JobErrorKind::WrongType("env"))),
        None => HashMap::new(),
    };

    let repository = parse_repository(raw, secret)?;

    Ok(Job {
        secret: secret.to_string(),
        commands,
        after_failure,
        image,
        env,
        repository,
    })
}

fn string_list(
    raw: &Value,
    field: &'static str,
    secret: &str,
) -> Result<Option<Vec<String>>, JobError> {
    match raw.get(field) {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| item.as_str().map(|s| s.to_string()))
            .collect::<Option<Vec<_>>>()
            .map(Some)
            .ok_or_else(|| JobError::new(Some(secret), JobErrorKind::WrongType(field))),
        Some(_) => Err(JobError::new(Some(secret), JobErrorKind::WrongType(field))),
        None => Ok(None),
    }
}

fn coerce_env_value(value: &Value, secret: &str) -> Result<String, JobError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(JobError::new(Some(secret), JobErrorKind::WrongType("env"))),
    }
}

fn parse_repository(raw: &Value, secret: &str) -> Result<Repository, JobError> {
    let repository = match raw.get("repository") {
        Some(Value::Object(_)) => &raw["repository"],
        Some(_) => {
            return Err(JobError::new(
                Some(secret),
                JobErrorKind::WrongType("repository"),
            ))
        }
        None => {
            return Err(JobError::new(
                Some(secret),
                JobErrorKind::MissingField("repository"),
            ))
        }
    };

    let field = |name: &'static str, key: &str| match repository.get(key) {
        Some(Value::String(value)) => Ok(value.clone()),
        Some(_) => Err(JobError::new(Some(secret), JobErrorKind::WrongType(name))),
        None => Err(JobError::new(Some(secret), JobErrorKind::MissingField(name))),
    };

    let private_keys = match repository.get("private_key") {
        Some(Value::String(path)) => vec![PathBuf::from(path)],
        Some(Value::Array(paths)) => paths
            .iter()
            .map(|path| path.as_str().map(PathBuf::from))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| {
                JobError::new(Some(secret), JobErrorKind::WrongType("repository.private_key"))
            })?,
        Some(_) => {
            return Err(JobError::new(
                Some(secret),
                JobErrorKind::WrongType("repository.private_key"),
            ))
        }
        None => Vec::new(),
    };

    Ok(Repository {
        origin: field("repository.origin", "origin")?,
        branch: field("repository.branch", "branch")?,
        commit: field("repository.commit", "commit")?,
        private_keys,
    })
}
