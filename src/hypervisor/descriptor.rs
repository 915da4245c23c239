//! Domain XML descriptor parsing
//!
//! Guests built by this agent keep their disks on a distributed volume and
//! reference them as network disks:
//!
//! ```text
//! <disk type='network' device='disk'>
//!   <source protocol='gluster' name='gv0/instances/<uuid>/disk0.qcow2'/>
//! </disk>
//! ```
//!
//! The first path component is the volume, the next two locate the guest's
//! working directory on that volume.

use roxmltree::{Document, Node};

use crate::error::HypervisorError;

/// Location of a guest's working directory on a distributed volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoragePath {
    pub volume: String,
    pub path: String,
}

impl StoragePath {
    /// Split a network disk source name (`<volume>/<dir>/<guest>/...`)
    pub fn from_source_name(name: &str) -> Result<Self, HypervisorError> {
        let parts: Vec<&str> = name.trim_matches('/').split('/').collect();
        if parts.len() < 3 || parts[..3].iter().any(|p| p.is_empty()) {
            return Err(HypervisorError::Descriptor(format!(
                "disk source {:?} does not name a guest directory",
                name
            )));
        }

        Ok(Self {
            volume: parts[0].to_string(),
            path: parts[1..3].join("/"),
        })
    }
}

fn parse(xml: &str) -> Result<Document<'_>, HypervisorError> {
    Document::parse(xml).map_err(|e| HypervisorError::Descriptor(e.to_string()))
}

fn child<'a, 'input>(node: Node<'a, 'input>, tag: &str) -> Option<Node<'a, 'input>> {
    node.children().find(|n| n.is_element() && n.has_tag_name(tag))
}

fn text_of(xml: &str, tag: &str) -> Result<Option<String>, HypervisorError> {
    let doc = parse(xml)?;
    Ok(child(doc.root_element(), tag)
        .and_then(|n| n.text())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty()))
}

/// The `<uuid>` of a domain descriptor, if it declares one
pub fn domain_uuid(xml: &str) -> Result<Option<String>, HypervisorError> {
    text_of(xml, "uuid")
}

/// The `<name>` of a domain descriptor, if it declares one
pub fn domain_name(xml: &str) -> Result<Option<String>, HypervisorError> {
    text_of(xml, "name")
}

/// Backing storage of the domain's first disk
pub fn storage_path(xml: &str) -> Result<StoragePath, HypervisorError> {
    let doc = parse(xml)?;
    let source_name = child(doc.root_element(), "devices")
        .and_then(|devices| child(devices, "disk"))
        .and_then(|disk| child(disk, "source"))
        .and_then(|source| source.attribute("name"))
        .ok_or_else(|| {
            HypervisorError::Descriptor("first disk has no network source name".to_string())
        })?;

    StoragePath::from_source_name(source_name)
}
