//! iSCSI target URL parsing
//!
//! `iscsi://<host>[:<port>]/<target-iqn>/<lun>`

use crate::error::{IscsiError, ScsiResult};
use std::fmt;
use std::str::FromStr;

/// Well-known iSCSI port
pub const DEFAULT_PORT: u16 = 3260;

/// Highest LUN expressible with flat space addressing
pub const MAX_LUN: u16 = 0x3FFF;

/// A parsed target URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetUrl {
    /// Target IQN
    pub target_name: String,
    /// `host:port` the portal listens on
    pub portal: String,
    pub lun: u16,
}

impl TargetUrl {
    pub fn parse(url: &str) -> ScsiResult<Self> {
        let rest = url
            .strip_prefix("iscsi://")
            .ok_or_else(|| IscsiError::Config(format!("target URL must start with iscsi://: {}", url)))?;

        let (authority, path) = rest
            .split_once('/')
            .ok_or_else(|| IscsiError::Config(format!("target URL has no target name: {}", url)))?;

        if authority.contains('@') {
            return Err(IscsiError::Config(
                "credentials in the target URL are not supported (CHAP is not implemented)".to_string(),
            ));
        }

        let portal = parse_portal(authority)?;

        let (target_name, lun) = path
            .rsplit_once('/')
            .ok_or_else(|| IscsiError::Config(format!("target URL has no LUN: {}", url)))?;

        if target_name.is_empty() || target_name.contains('/') {
            return Err(IscsiError::Config(format!("invalid target name in URL: {}", url)));
        }

        let lun: u16 = lun
            .parse()
            .map_err(|_| IscsiError::Config(format!("invalid LUN '{}' in target URL", lun)))?;
        if lun > MAX_LUN {
            return Err(IscsiError::Config(format!("LUN {} exceeds {}", lun, MAX_LUN)));
        }

        Ok(TargetUrl {
            target_name: target_name.to_string(),
            portal,
            lun,
        })
    }

    /// LUN field of the BHS, single level flat/peripheral addressing (SAM-2)
    pub fn lun_field(&self) -> u64 {
        let first_level: u16 = if self.lun < 256 {
            self.lun
        } else {
            0x4000 | self.lun
        };
        (first_level as u64) << 48
    }
}

fn parse_portal(authority: &str) -> ScsiResult<String> {
    if authority.is_empty() {
        return Err(IscsiError::Config("target URL has no host".to_string()));
    }

    // [v6addr]:port or [v6addr]
    if let Some(v6) = authority.strip_prefix('[') {
        let (host, after) = v6
            .split_once(']')
            .ok_or_else(|| IscsiError::Config(format!("unterminated IPv6 literal: {}", authority)))?;
        let port = match after.strip_prefix(':') {
            Some(p) => parse_port(p)?,
            None if after.is_empty() => DEFAULT_PORT,
            None => return Err(IscsiError::Config(format!("invalid portal: {}", authority))),
        };
        return Ok(format!("[{}]:{}", host, port));
    }

    match authority.split_once(':') {
        Some((host, port)) if !host.is_empty() => Ok(format!("{}:{}", host, parse_port(port)?)),
        Some(_) => Err(IscsiError::Config(format!("invalid portal: {}", authority))),
        None => Ok(format!("{}:{}", authority, DEFAULT_PORT)),
    }
}

fn parse_port(port: &str) -> ScsiResult<u16> {
    port.parse()
        .map_err(|_| IscsiError::Config(format!("invalid port '{}' in target URL", port)))
}

impl FromStr for TargetUrl {
    type Err = IscsiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TargetUrl::parse(s)
    }
}

impl fmt::Display for TargetUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "iscsi://{}/{}/{}", self.portal, self.target_name, self.lun)
    }
}
