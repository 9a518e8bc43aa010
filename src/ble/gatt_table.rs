//! Service/characteristic UUIDs for each management protocol a
//! [`crate::ble::session::BleSesn`] can speak, looked up once during GATT
//! discovery after connecting.

use uuid::Uuid;

use crate::session::MgmtProto;

/// The service/characteristic pair a session subscribes to and writes
/// requests on.
#[derive(Debug, Clone, Copy)]
pub struct GattTarget {
    pub service: Uuid,
    pub chr: Uuid,
}

/// 16-bit Bluetooth SIG-style UUIDs, expressed in the standard base form.
fn uuid16(short: u16) -> Uuid {
    Uuid::from_fields(
        0x0000_0000 | short as u32,
        0x0000,
        0x1000,
        &[0x80, 0x00, 0x00, 0x80, 0x5f, 0x9b, 0x34, 0xfb],
    )
}

/// The plain-NMP management service/characteristic.
pub fn nmp_target() -> GattTarget {
    GattTarget {
        service: uuid16(0xfe18),
        chr: uuid16(0xfe19),
    }
}

/// The OIC/OMP-over-GATT service/characteristic.
pub fn omp_target() -> GattTarget {
    GattTarget {
        service: uuid16(0xfe19),
        chr: uuid16(0xfe1a),
    }
}

/// Resolves the service/characteristic a session should discover and
/// subscribe to for `proto`. `CoapServer` sessions reuse the OMP
/// characteristic, since OMP is the CoAP-wrapped protocol.
pub fn target_for(proto: MgmtProto) -> GattTarget {
    match proto {
        MgmtProto::Nmp => nmp_target(),
        MgmtProto::Omp | MgmtProto::CoapServer => omp_target(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nmp_and_omp_targets_are_distinct() {
        let nmp = target_for(MgmtProto::Nmp);
        let omp = target_for(MgmtProto::Omp);
        assert_ne!(nmp.service, omp.service);
        assert_ne!(nmp.chr, omp.chr);
    }
}
