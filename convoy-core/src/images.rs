//! Image resolution.
//!
//! Runs before a service's container is created: build when asked to or when
//! the tag is missing and a build context exists, pull when the image is
//! missing locally, otherwise use what is there.

use crate::error::{ConvoyError, Result};
use crate::manifest::{ImageSource, Manifest, ServiceId};
use crate::runtime::{BuildRequest, ContainerRuntime};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// What resolving an image did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageAction {
    /// Already available locally
    Present,
    Pulled,
    Built,
}

/// Makes the image of a service available locally.
pub struct ImageResolver {
    manifest: Arc<Manifest>,
    runtime: Arc<dyn ContainerRuntime>,
}

impl ImageResolver {
    pub fn new(manifest: Arc<Manifest>, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { manifest, runtime }
    }

    /// Resolve the image of one service.
    ///
    /// With `force_build`, services that have a build context are always
    /// rebuilt. Failures are reported as `Creation` errors for the service.
    #[instrument(skip(self), fields(service = %self.manifest.service(id).name))]
    pub async fn ensure(&self, id: ServiceId, force_build: bool) -> Result<ImageAction> {
        let service = self.manifest.service(id);
        let fail = |what: &str, e: ConvoyError| ConvoyError::Creation {
            service: service.name.clone(),
            reason: format!("{} {}: {}", what, service.image.tag(), e),
        };

        match &service.image {
            ImageSource::Build { context, dockerfile, args, target, tag } => {
                if !force_build
                    && self.runtime.image_exists(tag).await.map_err(|e| fail("inspecting", e))?
                {
                    debug!(image = %tag, "Image present");
                    return Ok(ImageAction::Present);
                }

                info!(image = %tag, context = %context.display(), "Building image");
                let request = BuildRequest {
                    context: context.clone(),
                    dockerfile: dockerfile.clone(),
                    args: args.clone(),
                    target: target.clone(),
                    tag: tag.clone(),
                };
                self.runtime.build_image(&request).await.map_err(|e| fail("building", e))?;
                Ok(ImageAction::Built)
            }
            ImageSource::Pull { reference } => {
                if self.runtime.image_exists(reference).await.map_err(|e| fail("inspecting", e))? {
                    debug!(image = %reference, "Image present");
                    return Ok(ImageAction::Present);
                }

                info!(image = %reference, "Pulling image");
                self.runtime.pull_image(reference).await.map_err(|e| fail("pulling", e))?;
                Ok(ImageAction::Pulled)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::ComposeParser;
    use crate::testing::MockRuntime;
    use std::path::Path;

    fn setup(runtime: Arc<MockRuntime>) -> (ImageResolver, Arc<Manifest>) {
        let compose = ComposeParser::parse(
            "services:\n  db:\n    image: mongo:7\n  api:\n    build: .\n  web:\n    build: .\n    image: web:dev\n",
        )
        .unwrap();
        let manifest = Arc::new(Manifest::load(compose, Path::new("/tmp"), "demo").unwrap());
        (ImageResolver::new(manifest.clone(), runtime), manifest)
    }

    fn id(manifest: &Manifest, name: &str) -> ServiceId {
        manifest.service_by_name(name).unwrap().id
    }

    #[tokio::test]
    async fn test_missing_images_are_pulled_or_built() {
        let runtime = Arc::new(MockRuntime::default());
        let (resolver, manifest) = setup(runtime.clone());

        assert_eq!(resolver.ensure(id(&manifest, "db"), false).await.unwrap(), ImageAction::Pulled);
        assert_eq!(resolver.ensure(id(&manifest, "api"), false).await.unwrap(), ImageAction::Built);
        assert_eq!(runtime.calls_of("pull_image"), vec!["pull_image mongo:7"]);
        assert_eq!(runtime.calls_of("build_image"), vec!["build_image demo-api:latest"]);

        // Second pass finds both locally
        assert_eq!(resolver.ensure(id(&manifest, "db"), false).await.unwrap(), ImageAction::Present);
        assert_eq!(resolver.ensure(id(&manifest, "api"), false).await.unwrap(), ImageAction::Present);
    }

    #[tokio::test]
    async fn test_force_build_rebuilds_only_build_services() {
        let runtime = Arc::new(MockRuntime::default());
        runtime.add_image("mongo:7");
        runtime.add_image("web:dev");
        let (resolver, manifest) = setup(runtime.clone());

        assert_eq!(resolver.ensure(id(&manifest, "db"), true).await.unwrap(), ImageAction::Present);
        assert_eq!(resolver.ensure(id(&manifest, "web"), true).await.unwrap(), ImageAction::Built);
        assert_eq!(runtime.count("pull_image"), 0);
        assert_eq!(runtime.calls_of("build_image"), vec!["build_image web:dev"]);
    }

    #[tokio::test]
    async fn test_pull_failure_names_service() {
        let runtime = Arc::new(MockRuntime::default());
        runtime.fail_on("pull_image mongo:7");
        let (resolver, manifest) = setup(runtime);

        match resolver.ensure(id(&manifest, "db"), false).await {
            Err(ConvoyError::Creation { service, reason }) => {
                assert_eq!(service, "db");
                assert!(reason.contains("pulling mongo:7"));
            }
            other => panic!("expected creation error, got {:?}", other),
        }
    }
}
