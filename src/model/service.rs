//! The `HttpService` custom resource: an image to run plus an access mode
//! that decides which HTTP verbs the deployed service enables.

use serde::{Deserialize, Serialize};

use super::{ObjectMeta, Resource};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpService {
    pub metadata: ObjectMeta,
    pub spec: HttpServiceSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpServiceSpec {
    /// Container image for the `web` container.
    pub image: String,
    /// 1 = GET only, 2 = PUT only, 3 = GET+PUT, 4 = neither.
    /// Unknown values fall back to GET only.
    #[serde(default = "default_access_mode")]
    pub access_mode: i32,
}

fn default_access_mode() -> i32 {
    1
}

impl Resource for HttpService {
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl HttpService {
    pub fn new(name: impl Into<String>, image: impl Into<String>, access_mode: i32) -> Self {
        Self {
            metadata: ObjectMeta {
                name: name.into(),
                namespace: None,
                resource_version: 0,
            },
            spec: HttpServiceSpec {
                image: image.into(),
                access_mode,
            },
        }
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.metadata.namespace = Some(namespace.into());
        self
    }
}
