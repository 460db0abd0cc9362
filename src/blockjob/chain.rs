//! Locating images within a disk's backing chain.
//!
//! Callers name chain images in one of three ways:
//!
//! - by index: `vda[2]` or `[2]` (0 is the active image)
//! - by absolute path: `/images/base.qcow2`
//! - by node-name or file name: `vda-fmt2`, `base.qcow2`

use crate::error::{Error, Result};
use crate::vm::Disk;
use std::path::{Path, PathBuf};

/// A reference to one image of a backing chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    /// Position in the chain, optionally qualified by disk target.
    Index {
        /// Disk target the index was written against.
        target: Option<String>,
        /// Chain position.
        index: usize,
    },
    /// Absolute image path.
    Path(PathBuf),
    /// Node-name, or a file name / relative path.
    Name(String),
}

impl std::str::FromStr for Locator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::invalid("empty image locator"));
        }
        if let Some(body) = s.strip_suffix(']') {
            if let Some((target, index)) = body.rsplit_once('[') {
                let index = index
                    .parse()
                    .map_err(|_| Error::invalid(format!("invalid chain index in '{}'", s)))?;
                let target = (!target.is_empty()).then(|| target.to_string());
                return Ok(Locator::Index { target, index });
            }
        }
        if Path::new(s).is_absolute() {
            return Ok(Locator::Path(PathBuf::from(s)));
        }
        Ok(Locator::Name(s.to_string()))
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Locator::Index { target, index } => {
                write!(f, "{}[{}]", target.as_deref().unwrap_or(""), index)
            }
            Locator::Path(path) => write!(f, "{}", path.display()),
            Locator::Name(name) => write!(f, "{}", name),
        }
    }
}

/// A located chain image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    /// Chain position of the image.
    pub index: usize,
    /// Position of its overlay (the image directly above it).
    pub parent: Option<usize>,
}

/// Find the image `locator` refers to in `disk`'s chain.
pub fn resolve(disk: &Disk, locator: &Locator) -> Result<Resolved> {
    let index = match locator {
        Locator::Index { target, index } => {
            if let Some(target) = target {
                if *target != disk.target {
                    return Err(Error::invalid(format!(
                        "locator '{}' does not refer to disk '{}'",
                        locator, disk.target
                    )));
                }
            }
            (*index < disk.chain.len()).then_some(*index)
        }
        Locator::Path(path) => disk.position(path),
        Locator::Name(name) => disk
            .chain
            .iter()
            .position(|n| n.node_name.as_deref() == Some(name.as_str()))
            .or_else(|| {
                disk.chain
                    .iter()
                    .position(|n| n.path.ends_with(Path::new(name)))
            }),
    };

    let index = index.ok_or_else(|| {
        Error::not_found(format!(
            "image '{}' in the backing chain of disk '{}'",
            locator, disk.target
        ))
    })?;
    Ok(Resolved {
        index,
        parent: index.checked_sub(1),
    })
}

/// Position of the backing image of the image at `index`.
pub fn backing_of(disk: &Disk, index: usize) -> Result<usize> {
    if index + 1 < disk.chain.len() {
        Ok(index + 1)
    } else {
        let path = disk
            .chain
            .get(index)
            .map(|n| n.display())
            .unwrap_or_else(|| disk.target.clone());
        Err(Error::NoBackingFile(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::{ChainNode, ImageFormat};

    fn disk() -> Disk {
        Disk::new(
            "vda",
            "virtio-disk0",
            vec![
                ChainNode::new("/images/top.qcow2", ImageFormat::Qcow2).with_node_name("vda-fmt0"),
                ChainNode::new("/images/mid.qcow2", ImageFormat::Qcow2).with_node_name("vda-fmt1"),
                ChainNode::new("/images/base/base.raw", ImageFormat::Raw).with_node_name("vda-fmt2"),
            ],
        )
    }

    #[test]
    fn test_parse_forms() {
        assert_eq!(
            "vda[2]".parse::<Locator>().unwrap(),
            Locator::Index {
                target: Some("vda".into()),
                index: 2
            }
        );
        assert_eq!(
            "[0]".parse::<Locator>().unwrap(),
            Locator::Index {
                target: None,
                index: 0
            }
        );
        assert_eq!(
            "/images/mid.qcow2".parse::<Locator>().unwrap(),
            Locator::Path(PathBuf::from("/images/mid.qcow2"))
        );
        assert_eq!(
            "vda-fmt1".parse::<Locator>().unwrap(),
            Locator::Name("vda-fmt1".into())
        );
        assert!("vda[x]".parse::<Locator>().is_err());
        assert!("".parse::<Locator>().is_err());
    }

    #[test]
    fn test_resolve_each_form() {
        let disk = disk();
        let by_index = resolve(&disk, &"vda[1]".parse().unwrap()).unwrap();
        let by_path = resolve(&disk, &"/images/mid.qcow2".parse().unwrap()).unwrap();
        let by_node = resolve(&disk, &"vda-fmt1".parse().unwrap()).unwrap();
        let by_file = resolve(&disk, &"mid.qcow2".parse().unwrap()).unwrap();
        for r in [by_index, by_path, by_node, by_file] {
            assert_eq!(r, Resolved { index: 1, parent: Some(0) });
        }
        let relative = resolve(&disk, &"base/base.raw".parse().unwrap()).unwrap();
        assert_eq!(relative.index, 2);
    }

    #[test]
    fn test_active_image_has_no_parent() {
        let r = resolve(&disk(), &"[0]".parse().unwrap()).unwrap();
        assert_eq!(r.parent, None);
    }

    #[test]
    fn test_unknown_image_not_found() {
        let disk = disk();
        for loc in ["vda[3]", "/images/other.qcow2", "vda-fmt9"] {
            let err = resolve(&disk, &loc.parse().unwrap()).unwrap_err();
            assert!(matches!(err, Error::NotFound(_)), "{}", loc);
        }
        let err = resolve(&disk, &"vdb[1]".parse().unwrap()).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_backing_of_bottom_image() {
        let disk = disk();
        assert_eq!(backing_of(&disk, 0).unwrap(), 1);
        let err = backing_of(&disk, 2).unwrap_err();
        assert!(matches!(err, Error::NoBackingFile(_)));
        assert!(err.to_string().contains("base.raw"));
    }
}
