//! APDU framing for the signing device.
//!
//! Requests are a fixed 5-byte header followed by the payload:
//!
//! ```text
//! | CLA | INS | P1 | P2 | LEN | PAYLOAD (LEN bytes) |
//! ```
//!
//! Responses carry no framing of their own: every byte delivered for a read
//! event belongs to the single outstanding command.

use crate::device::{Result, SignerError};

pub const CLA: u8 = 0xE0;
pub const INS_GET_PUBKEY: u8 = 0x02;
pub const INS_SIGN_TX: u8 = 0x04;

/// P1 flag telling the device a derivation path follows the header
pub const P1_PATH_FOLLOWS: u8 = 0x40;

pub const HEADER_LEN: usize = 5;
pub const MAX_PAYLOAD_LEN: usize = u8::MAX as usize;

const HARDENED: u32 = 0x8000_0000;
const PURPOSE: u32 = 44;
const COIN_TYPE: u32 = 3030;

/// Hardened purpose and coin type, big-endian, prepended to every account index
pub const DERIVATION_PREFIX: [u8; 8] = derivation_prefix();

const fn derivation_prefix() -> [u8; 8] {
    let purpose = (PURPOSE | HARDENED).to_be_bytes();
    let coin = (COIN_TYPE | HARDENED).to_be_bytes();
    [
        purpose[0], purpose[1], purpose[2], purpose[3], coin[0], coin[1], coin[2], coin[3],
    ]
}

/// A command understood by the signing device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApduCommand {
    /// Derive the account identity at `index`
    GetAccount { index: u32 },
    /// Sign `payload` exactly as given
    SignTransaction { payload: Vec<u8> },
}

impl ApduCommand {
    pub fn instruction(&self) -> u8 {
        match self {
            ApduCommand::GetAccount { .. } => INS_GET_PUBKEY,
            ApduCommand::SignTransaction { .. } => INS_SIGN_TX,
        }
    }

    fn params(&self) -> (u8, u8) {
        match self {
            ApduCommand::GetAccount { .. } => (P1_PATH_FOLLOWS, 0x00),
            ApduCommand::SignTransaction { .. } => (0x00, 0x00),
        }
    }

    /// Encode into a request frame.
    ///
    /// Fails with [`SignerError::PayloadTooLarge`] when the payload does not
    /// fit the one-byte length field.
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            ApduCommand::GetAccount { index } => {
                let mut path = Vec::with_capacity(DERIVATION_PREFIX.len() + 4);
                path.extend_from_slice(&DERIVATION_PREFIX);
                path.extend_from_slice(&index.to_be_bytes());
                Ok(self.frame(&path))
            }
            ApduCommand::SignTransaction { payload } => {
                if payload.len() > MAX_PAYLOAD_LEN {
                    return Err(SignerError::PayloadTooLarge { len: payload.len() });
                }
                Ok(self.frame(payload))
            }
        }
    }

    fn frame(&self, payload: &[u8]) -> Vec<u8> {
        let (p1, p2) = self.params();
        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
        frame.extend_from_slice(&[CLA, self.instruction(), p1, p2, payload.len() as u8]);
        frame.extend_from_slice(payload);
        frame
    }
}

/// Decoded request header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApduHeader {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub len: u8,
}

impl ApduHeader {
    /// Parse the header of `frame` and return it with the payload slice.
    pub fn parse(frame: &[u8]) -> Result<(Self, &[u8])> {
        if frame.len() < HEADER_LEN {
            return Err(SignerError::MalformedResponse(format!(
                "frame of {} bytes is shorter than the {}-byte header",
                frame.len(),
                HEADER_LEN
            )));
        }
        let header = ApduHeader {
            cla: frame[0],
            ins: frame[1],
            p1: frame[2],
            p2: frame[3],
            len: frame[4],
        };
        let payload = &frame[HEADER_LEN..];
        if payload.len() != header.len as usize {
            return Err(SignerError::MalformedResponse(format!(
                "declared length {} but {} payload bytes follow",
                header.len,
                payload.len()
            )));
        }
        Ok((header, payload))
    }
}

/// Interpret a GetAccount response as a printable account identifier.
pub fn decode_account_id(data: &[u8]) -> Result<String> {
    let text = std::str::from_utf8(data)
        .map_err(|e| SignerError::MalformedResponse(format!("account id is not UTF-8: {}", e)))?;
    let id = text.trim();
    if id.is_empty() {
        return Err(SignerError::MalformedResponse("empty account id".to_string()));
    }
    if id.chars().any(char::is_control) {
        return Err(SignerError::MalformedResponse(format!(
            "account id contains control characters: {}",
            hex::encode(data)
        )));
    }
    Ok(id.to_string())
}

/// Signatures are returned to the caller untouched.
pub fn decode_signature(data: &[u8]) -> Vec<u8> {
    data.to_vec()
}
