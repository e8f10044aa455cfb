//! Mapping of absolute pathnames onto bucket / object names.
//!
//! The first path component is the bucket, everything after the next `/` is
//! the object name (which may itself contain slashes).

use crate::error::Error;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ObjectPath {
    pub bucket: Option<String>,
    pub object: Option<String>,
}

impl ObjectPath {
    /// Returns `(bucket, object)` or `Error::InvalidPath(message)` when the path
    /// does not reach into a bucket.
    pub fn require_object(self, message: &str) -> Result<(String, String), Error> {
        match (self.bucket, self.object) {
            (Some(bucket), Some(object)) => Ok((bucket, object)),
            _ => Err(Error::InvalidPath(message.to_string())),
        }
    }
}

pub fn split(path: &str) -> Result<ObjectPath, Error> {
    let Some(rest) = path.strip_prefix('/') else {
        return Err(Error::InvalidPath(format!(
            "pathname must be absolute: {path:?}"
        )));
    };
    if rest.is_empty() {
        return Ok(ObjectPath::default());
    }
    let (bucket, object) = match rest.split_once('/') {
        Some((bucket, "")) => (bucket, None),
        Some((bucket, object)) => (bucket, Some(object.to_string())),
        None => (rest, None),
    };
    Ok(ObjectPath {
        bucket: Some(bucket.to_string()),
        object,
    })
}
