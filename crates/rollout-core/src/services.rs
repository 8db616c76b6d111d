use serde::{Deserialize, Serialize};

/// A deployable service as registered at startup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Key clients use in `POST /deploy`.
    pub handle: String,
    /// Image repository, without tag.
    pub docker_image: String,
    /// Deploy target handed to the release command.
    pub rancher_service_id: String,
}

impl Service {
    pub fn new(
        handle: impl Into<String>,
        docker_image: impl Into<String>,
        rancher_service_id: impl Into<String>,
    ) -> Self {
        Self {
            handle: handle.into(),
            docker_image: docker_image.into(),
            rancher_service_id: rancher_service_id.into(),
        }
    }

    /// `image:tag` reference for a release.
    pub fn image_ref(&self, tag: &str) -> String {
        format!("{}:{}", self.docker_image, tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_ref_joins_with_colon() {
        let svc = Service::new("api", "acme/api", "1s42");
        assert_eq!(svc.image_ref("v1.2.3"), "acme/api:v1.2.3");
    }
}
