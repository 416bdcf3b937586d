use gethostname::gethostname;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TagsError {
    #[error("no tags found for container {0}")]
    NotFound(String),
    #[error("tags source unavailable: {0}")]
    Unavailable(String),
}

/// Looks up the tags describing a container.
pub trait TagsResolver: Send + Sync {
    fn resolve(&self, container_id: &str) -> Result<Vec<String>, TagsError>;
}

/// Tags known locally: the container id and the host name.
pub struct HostTagsResolver {
    hostname: String,
}

impl HostTagsResolver {
    pub fn new() -> Self {
        Self {
            hostname: gethostname().to_string_lossy().into_owned(),
        }
    }
}

impl Default for HostTagsResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl TagsResolver for HostTagsResolver {
    fn resolve(&self, container_id: &str) -> Result<Vec<String>, TagsError> {
        if container_id.is_empty() {
            return Err(TagsError::NotFound(container_id.to_string()));
        }
        Ok(vec![
            format!("container_id:{container_id}"),
            format!("host:{}", self.hostname),
        ])
    }
}
