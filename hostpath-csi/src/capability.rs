//! Volume capability negotiation.
//!
//! Only filesystem access on a single node is offered: block access and
//! multi-node modes are never confirmed.

use crate::csi::VolumeCapability;
use crate::csi::volume_capability::AccessType;
use crate::csi::volume_capability::access_mode::Mode;
use crate::error::{Error, Result};

fn supported_mode(mode: Mode) -> bool {
    matches!(mode, Mode::SingleNodeWriter | Mode::SingleNodeReaderOnly)
}

fn check(cap: &VolumeCapability) -> Result<()> {
    match cap.access_type {
        None => return Err(Error::MissingCapability),
        Some(AccessType::Block(_)) => return Err(Error::UnsupportedAccessType),
        Some(AccessType::Mount(_)) => {}
    }
    match &cap.access_mode {
        Some(mode) if supported_mode(mode.mode()) => Ok(()),
        _ => Err(Error::UnsupportedAccessMode),
    }
}

/// Whether every capability in `caps` can be honoured.
pub fn is_supported(caps: &[VolumeCapability]) -> bool {
    caps.iter().all(|cap| check(cap).is_ok())
}

/// Like [`is_supported`] but reports the first offending capability and
/// rejects an empty list.
pub fn validate(caps: &[VolumeCapability]) -> Result<()> {
    if caps.is_empty() {
        return Err(Error::MissingCapabilities);
    }
    caps.iter().try_for_each(check)
}

/// Validate a single node-side capability. Node calls accept any access
/// mode the controller already agreed to but never block access.
pub fn validate_node(cap: &VolumeCapability) -> Result<()> {
    match cap.access_type {
        None => Err(Error::MissingCapability),
        Some(AccessType::Block(_)) => Err(Error::UnsupportedAccessType),
        Some(AccessType::Mount(_)) => Ok(()),
    }
}
