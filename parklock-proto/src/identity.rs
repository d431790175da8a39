//! Device identity and advertise fingerprint derivation

use crate::{Generation, ProtoError};

/// Fingerprint lengths a scan can match: Gen1 (12) and Gen2 (14)
const FINGERPRINT_LENGTHS: [usize; 2] = [12, 14];

/// Colon separated MAC address, six hex octet pairs.
///
/// Letter case is kept because Gen2 locks advertise it verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MacAddress(String);

impl MacAddress {
    pub fn parse(s: &str) -> Result<Self, ProtoError> {
        let octets: Vec<&str> = s.split(':').collect();
        let valid = octets.len() == 6
            && octets
                .iter()
                .all(|o| o.len() == 2 && o.bytes().all(|b| b.is_ascii_hexdigit()));

        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(ProtoError::InvalidDeviceId(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Octet pairs in written order
    pub fn octets(&self) -> impl Iterator<Item = &str> {
        self.0.split(':')
    }
}

impl std::str::FromStr for MacAddress {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for MacAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive the string a lock advertises, used to match scan results.
///
/// Gen1 locks put their MAC in manufacturer data with the octets reversed,
/// Gen2 locks advertise `DN` + MAC as their local name.
pub fn advertise_fingerprint(mac: &MacAddress, generation: Generation) -> String {
    match generation {
        Generation::Gen1 => {
            let octets: Vec<&str> = mac.octets().collect();
            octets.iter().rev().copied().collect::<String>().to_lowercase()
        }
        Generation::Gen2 => format!("DN{}", mac.octets().collect::<String>()),
    }
}

pub fn validate_fingerprint(fingerprint: &str) -> Result<(), ProtoError> {
    if FINGERPRINT_LENGTHS.contains(&fingerprint.len()) {
        Ok(())
    } else {
        Err(ProtoError::InvalidAdvertiseData(fingerprint.to_string()))
    }
}

/// A configured lock. Immutable until the session is reconfigured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    mac: MacAddress,
    generation: Generation,
    secret_key: String,
    fingerprint: String,
}

impl DeviceIdentity {
    pub fn new(
        device_id: &str,
        generation: Generation,
        secret_key: Option<&str>,
    ) -> Result<Self, ProtoError> {
        let mac = MacAddress::parse(device_id)?;
        let secret_key = secret_key.unwrap_or_default().to_string();

        if generation == Generation::Gen2 {
            if secret_key.is_empty() {
                return Err(ProtoError::MissingSecretKey);
            }
            if secret_key.len() % 2 != 0 || !secret_key.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(ProtoError::InvalidSecretKey);
            }
        }

        let fingerprint = advertise_fingerprint(&mac, generation);
        validate_fingerprint(&fingerprint)?;

        Ok(Self {
            mac,
            generation,
            secret_key,
            fingerprint,
        })
    }

    pub fn mac(&self) -> &MacAddress {
        &self.mac
    }

    /// Generation declared by the caller. The link may detect otherwise.
    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn secret_key(&self) -> &str {
        &self.secret_key
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}
