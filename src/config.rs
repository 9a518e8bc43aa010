//! Plain configuration surfaces. These structs describe *what* a transport
//! or session needs to know to start; *loading* them from a file or CLI
//! flags is left to the embedding application.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::session::{EncryptWhen, MgmtProto, PeerSpec};

fn default_conn_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_preferred_mtu() -> u16 {
    512
}

/// Out-of-band pairing key material, when a peer requires it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OobKey(pub Vec<u8>);

/// Host-facing address type preference for the local BLE controller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OwnAddrType {
    Public,
    Random,
    RpaPublicDefault,
    RpaRandomDefault,
}

impl Default for OwnAddrType {
    fn default() -> Self {
        OwnAddrType::Public
    }
}

/// Configuration shared by every [`crate::ble::transport::BleTransport`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleXportCfg {
    /// Path to the `blehostd` binary.
    pub blehostd_path: PathBuf,
    /// UNIX socket path the daemon subprocess listens on.
    pub sock_path: PathBuf,
    #[serde(default = "default_conn_timeout", with = "duration_secs")]
    pub conn_timeout: Duration,
    #[serde(default)]
    pub own_addr_type: OwnAddrType,
}

impl Default for BleXportCfg {
    fn default() -> Self {
        Self {
            blehostd_path: PathBuf::from("blehostd"),
            sock_path: PathBuf::from("/tmp/blehostd.sock"),
            conn_timeout: default_conn_timeout(),
            own_addr_type: OwnAddrType::default(),
        }
    }
}

/// Configuration for a single [`crate::ble::session::BleSesn`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleSesnCfg {
    pub peer: PeerSpec,
    #[serde(default)]
    pub mgmt_proto: MgmtProto,
    #[serde(default)]
    pub encrypt_when: EncryptWhen,
    #[serde(default = "default_preferred_mtu")]
    pub preferred_mtu: u16,
    #[serde(default)]
    pub oob_key: Option<OobKey>,
}

impl Default for BleSesnCfg {
    fn default() -> Self {
        Self {
            peer: PeerSpec::Name(String::new()),
            mgmt_proto: MgmtProto::Nmp,
            encrypt_when: EncryptWhen::Never,
            preferred_mtu: default_preferred_mtu(),
            oob_key: None,
        }
    }
}

/// Configuration shared by every [`crate::serial::transport::SerialTransport`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialXportCfg {
    pub dev_path: PathBuf,
    pub baud_rate: u32,
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    #[serde(default = "default_conn_timeout", with = "duration_secs")]
    pub read_timeout: Duration,
}

fn default_mtu() -> u16 {
    1024
}

impl Default for SerialXportCfg {
    fn default() -> Self {
        Self {
            dev_path: PathBuf::from("/dev/ttyUSB0"),
            baud_rate: 115_200,
            mtu: default_mtu(),
            read_timeout: default_conn_timeout(),
        }
    }
}

mod duration_secs {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

// `MgmtProto`/`EncryptWhen`/`PeerSpec` need (De)serialize to live in a
// config struct; these mirror the hand-written variants in `session.rs`.
impl Serialize for MgmtProto {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let name = match self {
            MgmtProto::Nmp => "nmp",
            MgmtProto::Omp => "omp",
            MgmtProto::CoapServer => "coap_server",
        };
        s.serialize_str(name)
    }
}

impl<'de> Deserialize<'de> for MgmtProto {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        match s.as_str() {
            "nmp" => Ok(MgmtProto::Nmp),
            "omp" => Ok(MgmtProto::Omp),
            "coap_server" => Ok(MgmtProto::CoapServer),
            other => Err(serde::de::Error::custom(format!("unknown mgmt_proto {other}"))),
        }
    }
}

impl Serialize for EncryptWhen {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let name = match self {
            EncryptWhen::Never => "never",
            EncryptWhen::Always => "always",
            EncryptWhen::IfRequired => "if_required",
        };
        s.serialize_str(name)
    }
}

impl<'de> Deserialize<'de> for EncryptWhen {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        match s.as_str() {
            "never" => Ok(EncryptWhen::Never),
            "always" => Ok(EncryptWhen::Always),
            "if_required" => Ok(EncryptWhen::IfRequired),
            other => Err(serde::de::Error::custom(format!("unknown encrypt_when {other}"))),
        }
    }
}

impl Serialize for PeerSpec {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            PeerSpec::Name(n) => s.serialize_newtype_variant("PeerSpec", 0, "name", n),
            PeerSpec::Resolved(n) => s.serialize_newtype_variant("PeerSpec", 1, "resolved", n),
        }
    }
}

impl<'de> Deserialize<'de> for PeerSpec {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        enum Repr {
            #[serde(rename = "name")]
            Name(String),
            #[serde(rename = "resolved")]
            Resolved(String),
        }
        match Repr::deserialize(d)? {
            Repr::Name(n) => Ok(PeerSpec::Name(n)),
            Repr::Resolved(n) => Ok(PeerSpec::Resolved(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ble_xport_cfg_defaults_are_sane() {
        let cfg = BleXportCfg::default();
        assert_eq!(cfg.conn_timeout, Duration::from_secs(5));
    }

    #[test]
    fn ble_sesn_cfg_roundtrips_through_json() {
        let cfg = BleSesnCfg {
            peer: PeerSpec::Name("nrf52-dk".into()),
            mgmt_proto: MgmtProto::Omp,
            encrypt_when: EncryptWhen::IfRequired,
            preferred_mtu: 256,
            oob_key: None,
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: BleSesnCfg = serde_json::from_str(&json).unwrap();
        assert_eq!(back.preferred_mtu, 256);
        assert_eq!(back.mgmt_proto, MgmtProto::Omp);
    }
}
