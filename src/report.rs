//! C1: Binary Reader — SPDM measurement report decoding.
//!
//! Wire layout (fixed-schema, strict):
//!
//! ```text
//! [0]        version            (u8, must be SUPPORTED_VERSION)
//! [1..33]    request_nonce      (32 bytes, request half)
//! [33..37]   measurement_count  (u32 LE)
//! ...        measurements       (see Measurement::read)
//! [..]       opaque_count       (u16 LE)
//! ...        opaque entries     {tag: u16 LE, len: u16 LE, bytes}
//! [-SIG_LEN..] signature        (ECDSA-SHA384 DER, covers bytes[0..len-SIG_LEN])
//! ```
//!
//! Parsing never trusts declared sizes beyond the buffer: any truncation or
//! overrun is `MalformedReport`.

use std::collections::BTreeMap;

use crate::error::{AttestError, AttestResult};

pub const SUPPORTED_VERSION: u8 = 1;
pub const NONCE_LEN: usize = 32;

/// Well-known opaque data tags. `as_str()`/`all()` follow the same
/// const-array idiom used for enumerations elsewhere in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u16)]
pub enum OpaqueTag {
    DriverVersion = 1,
    VbiosVersion = 2,
    Project = 3,
    ProjectSku = 4,
    ChipSku = 5,
    Fwid = 6,
}

impl OpaqueTag {
    pub const fn as_str(&self) -> &'static str {
        match self {
            OpaqueTag::DriverVersion => "DRIVER_VERSION",
            OpaqueTag::VbiosVersion => "VBIOS_VERSION",
            OpaqueTag::Project => "PROJECT",
            OpaqueTag::ProjectSku => "PROJECT_SKU",
            OpaqueTag::ChipSku => "CHIP_SKU",
            OpaqueTag::Fwid => "FWID",
        }
    }

    pub const fn all() -> [OpaqueTag; 6] {
        [
            OpaqueTag::DriverVersion,
            OpaqueTag::VbiosVersion,
            OpaqueTag::Project,
            OpaqueTag::ProjectSku,
            OpaqueTag::ChipSku,
            OpaqueTag::Fwid,
        ]
    }

    fn from_u16(raw: u16) -> Option<OpaqueTag> {
        Self::all().into_iter().find(|t| *t as u16 == raw)
    }
}

#[derive(Debug, Clone)]
pub struct Measurement {
    pub index: u32,
    pub size: u16,
    pub alternatives: Vec<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct AttestationReport {
    pub version: u8,
    pub request_nonce: Vec<u8>,
    pub measurements: Vec<Measurement>,
    pub opaque: BTreeMap<u16, Vec<u8>>,
    pub signature: Vec<u8>,
    pub signed_region: Vec<u8>,
}

const SIGNATURE_LEN: usize = 96; // DER-encoded ECDSA-P384 signatures are bounded comfortably by this; exact length is read off the trailing length-prefix below.

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> AttestResult<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(AttestError::MalformedReport(format!(
                "buffer truncated: need {n} bytes at offset {}, have {}",
                self.pos,
                self.buf.len()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_u8(&mut self) -> AttestResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn take_u16(&mut self) -> AttestResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn take_u32(&mut self) -> AttestResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Parse a raw SPDM measurement report into its structured form.
pub fn parse_report(bytes: &[u8]) -> AttestResult<AttestationReport> {
    if bytes.len() < 1 + NONCE_LEN + 4 + 2 + 2 {
        return Err(AttestError::MalformedReport("report shorter than minimum fixed header".into()));
    }

    // Signature is a trailing length-prefixed block: [..][sig_len: u16 LE][sig bytes].
    if bytes.len() < 2 {
        return Err(AttestError::MalformedReport("report too short for signature trailer".into()));
    }
    let sig_len = u16::from_le_bytes([bytes[bytes.len() - 2], bytes[bytes.len() - 1]]) as usize;
    if sig_len > SIGNATURE_LEN || bytes.len() < 2 + sig_len {
        return Err(AttestError::MalformedReport("declared signature length exceeds buffer".into()));
    }
    let body_end = bytes.len() - 2 - sig_len;
    let signature = bytes[body_end..bytes.len() - 2].to_vec();
    let signed_region = bytes[..body_end].to_vec();

    let mut cur = Cursor::new(&bytes[..body_end]);

    let version = cur.take_u8()?;
    if version != SUPPORTED_VERSION {
        return Err(AttestError::MalformedReport(format!("unsupported SPDM version {version}")));
    }

    let request_nonce = cur.take(NONCE_LEN)?.to_vec();

    let measurement_count = cur.take_u32()?;
    let mut measurements = Vec::with_capacity(measurement_count as usize);
    for expected_index in 0..measurement_count {
        let index = cur.take_u32()?;
        if index != expected_index {
            return Err(AttestError::MalformedReport(format!(
                "measurement indices must be dense from 0: expected {expected_index}, got {index}"
            )));
        }
        let size = cur.take_u16()?;
        let num_alternatives = cur.take_u8()?;
        let mut alternatives = Vec::with_capacity(num_alternatives as usize);
        for _ in 0..num_alternatives {
            alternatives.push(cur.take(size as usize)?.to_vec());
        }
        measurements.push(Measurement { index, size, alternatives });
    }

    let opaque_count = cur.take_u16()?;
    let mut opaque = BTreeMap::new();
    for _ in 0..opaque_count {
        let tag = cur.take_u16()?;
        let len = cur.take_u16()?;
        let value = cur.take(len as usize)?.to_vec();
        if opaque.insert(tag, value).is_some() {
            return Err(AttestError::MalformedReport(format!("duplicate opaque tag {tag}")));
        }
    }

    Ok(AttestationReport {
        version,
        request_nonce,
        measurements,
        opaque,
        signature,
        signed_region,
    })
}

/// Fetch an opaque field by its well-known tag.
pub fn opaque_get<'a>(report: &'a AttestationReport, tag: OpaqueTag) -> Option<&'a [u8]> {
    report.opaque.get(&(tag as u16)).map(Vec::as_slice)
}

/// ASCII opaque fields are trimmed of trailing NULs and whitespace before use.
pub fn opaque_get_ascii(report: &AttestationReport, tag: OpaqueTag) -> Option<String> {
    opaque_get(report, tag).map(|bytes| {
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        String::from_utf8_lossy(&bytes[..end]).trim().to_string()
    })
}

pub fn measurements(report: &AttestationReport) -> &[Measurement] {
    &report.measurements
}

/// Canonical `XX.XX.XX.XX` uppercase-hex dot-separated form from the raw
/// 4-byte VBIOS opaque value.
pub fn format_vbios_version(raw: &[u8]) -> String {
    raw.iter().map(|b| format!("{b:02X}")).collect::<Vec<_>>().join(".")
}

/// For RIM-ID composition: same digits, dots stripped.
pub fn format_vbios_version_nodots(raw: &[u8]) -> String {
    raw.iter().map(|b| format!("{b:02X}")).collect::<Vec<_>>().join("")
}
