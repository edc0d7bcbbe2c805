//! Image registry: resolves a role's image selector to a machine image id.
//!
//! Images are keyed on OS family and the version of the software baked into
//! them. A selector names the family, the software, and a semver
//! requirement; the registry returns the highest matching version.

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// A pre-built machine image with an agent able to consume boot payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineImage {
    pub id: String,
    pub os_family: String,
    pub software: String,
    pub version: String,
}

/// What a role asks the registry for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSelector {
    pub os_family: String,
    pub software: String,
    /// Semver requirement, e.g. `"^1.15"` or `"=1.4.2"`.
    pub version: String,
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("invalid version requirement {requirement:?} for {software}: {reason}")]
    InvalidRequirement {
        software: String,
        requirement: String,
        reason: String,
    },

    #[error("no {os_family} image with {software} matching {requirement}")]
    NoMatch {
        os_family: String,
        software: String,
        requirement: String,
    },
}

/// Lookup of immutable machine images.
pub trait ImageRegistry: Send + Sync {
    fn resolve(&self, selector: &ImageSelector) -> Result<MachineImage, ImageError>;
}

/// Static catalog of known images, usually loaded from the manifest.
#[derive(Debug, Clone, Default)]
pub struct ImageCatalog {
    images: Vec<MachineImage>,
}

impl ImageCatalog {
    pub fn new(images: Vec<MachineImage>) -> Self {
        Self { images }
    }

    pub fn images(&self) -> &[MachineImage] {
        &self.images
    }
}

impl ImageRegistry for ImageCatalog {
    fn resolve(&self, selector: &ImageSelector) -> Result<MachineImage, ImageError> {
        let req = VersionReq::parse(&selector.version).map_err(|e| ImageError::InvalidRequirement {
            software: selector.software.clone(),
            requirement: selector.version.clone(),
            reason: e.to_string(),
        })?;

        let mut best: Option<(Version, &MachineImage)> = None;
        for image in &self.images {
            if !image.os_family.eq_ignore_ascii_case(&selector.os_family)
                || !image.software.eq_ignore_ascii_case(&selector.software)
            {
                continue;
            }
            let version = match Version::parse(&image.version) {
                Ok(v) => v,
                Err(e) => {
                    warn!(image = %image.id, version = %image.version, error = %e, "skipping image with invalid version");
                    continue;
                }
            };
            if !req.matches(&version) {
                continue;
            }
            let better = match &best {
                None => true,
                // Equal versions: lowest id wins so resolution stays deterministic.
                Some((v, current)) => version > *v || (version == *v && image.id < current.id),
            };
            if better {
                best = Some((version, image));
            }
        }

        match best {
            Some((version, image)) => {
                debug!(image = %image.id, software = %image.software, %version, "image resolved");
                Ok(image.clone())
            }
            None => Err(ImageError::NoMatch {
                os_family: selector.os_family.clone(),
                software: selector.software.clone(),
                requirement: selector.version.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(id: &str, os: &str, software: &str, version: &str) -> MachineImage {
        MachineImage {
            id: id.to_string(),
            os_family: os.to_string(),
            software: software.to_string(),
            version: version.to_string(),
        }
    }

    fn selector(os: &str, software: &str, version: &str) -> ImageSelector {
        ImageSelector {
            os_family: os.to_string(),
            software: software.to_string(),
            version: version.to_string(),
        }
    }

    fn catalog() -> ImageCatalog {
        ImageCatalog::new(vec![
            image("ami-consul-114", "ubuntu", "consul", "1.14.9"),
            image("ami-consul-115", "ubuntu", "consul", "1.15.2"),
            image("ami-consul-116", "ubuntu", "consul", "1.16.0"),
            image("ami-consul-al2", "amazon-linux", "consul", "1.15.4"),
            image("ami-vault-113", "ubuntu", "vault", "1.13.1"),
            image("ami-broken", "ubuntu", "vault", "not-a-version"),
        ])
    }

    #[test]
    fn resolves_highest_matching_version() {
        let img = catalog().resolve(&selector("ubuntu", "consul", "~1.15")).unwrap();
        assert_eq!(img.id, "ami-consul-115");

        let img = catalog().resolve(&selector("ubuntu", "consul", ">=1.14")).unwrap();
        assert_eq!(img.id, "ami-consul-116");
    }

    #[test]
    fn os_family_is_part_of_the_key() {
        let img = catalog()
            .resolve(&selector("amazon-linux", "consul", "^1"))
            .unwrap();
        assert_eq!(img.id, "ami-consul-al2");
    }

    #[test]
    fn invalid_image_versions_are_skipped() {
        let img = catalog().resolve(&selector("ubuntu", "vault", "*")).unwrap();
        assert_eq!(img.id, "ami-vault-113");
    }

    #[test]
    fn no_match_is_an_error() {
        let err = catalog()
            .resolve(&selector("ubuntu", "vault", "^2"))
            .unwrap_err();
        assert!(matches!(err, ImageError::NoMatch { .. }));
    }

    #[test]
    fn bad_requirement_is_an_error() {
        let err = catalog()
            .resolve(&selector("ubuntu", "vault", "one point two"))
            .unwrap_err();
        assert!(matches!(err, ImageError::InvalidRequirement { .. }));
    }

    #[test]
    fn equal_versions_pick_lowest_id() {
        let catalog = ImageCatalog::new(vec![
            image("ami-b", "ubuntu", "vault", "1.0.0"),
            image("ami-a", "ubuntu", "vault", "1.0.0"),
        ]);
        let img = catalog.resolve(&selector("ubuntu", "vault", "1")).unwrap();
        assert_eq!(img.id, "ami-a");
    }
}
