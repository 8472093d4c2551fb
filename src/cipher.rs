use std::net::IpAddr;

use anyhow::{bail, Result};
use rsa::{pkcs1::DecodeRsaPrivateKey, PaddingScheme, RsaPrivateKey};

lazy_static::lazy_static! {
    pub static ref KEY: RsaPrivateKey = RsaPrivateKey::from_pkcs1_pem(include_str!("rtsp.key")).unwrap();
}

/// Signs the source's `Apple-Challenge` with the receiver identity: the
/// decoded challenge, followed by the local address of the accepting socket
/// and the hardware address, zero-padded to at least 32 bytes.
pub struct AppleChallenge {
    local_addr: IpAddr,
    hw_addr: [u8; 6],
}

impl AppleChallenge {
    pub fn new(local_addr: IpAddr, hw_addr: [u8; 6]) -> Self {
        Self { local_addr, hw_addr }
    }

    pub fn response(&self, challenge: &str) -> Result<String> {
        let challenge = base64::decode(challenge)?;
        if challenge.len() > 16 {
            bail!("oversized Apple-Challenge of {} bytes", challenge.len());
        }

        let mut buf = challenge;
        match self.local_addr {
            IpAddr::V4(ip) => buf.extend_from_slice(&ip.octets()),
            IpAddr::V6(ip) => buf.extend_from_slice(&ip.octets()),
        }
        buf.extend_from_slice(&self.hw_addr);
        if buf.len() < 32 {
            buf.resize(32, 0);
        }

        let signature = KEY.sign(PaddingScheme::new_pkcs1v15_sign(None), &buf)?;

        Ok(base64::encode(signature).trim_end_matches('=').to_string())
    }
}

/// RSA-OAEP unwrap of the session AES key carried in `a=rsaaeskey:`.
pub fn unwrap_session_key(rsaaeskey: &[u8]) -> Result<[u8; 16]> {
    let key = KEY.decrypt(PaddingScheme::new_oaep::<sha1::Sha1>(), rsaaeskey)?;
    if key.len() != 16 {
        bail!("announced rsaaeskey of {} bytes, wanted 16", key.len());
    }

    let mut out = [0; 16];
    out.copy_from_slice(&key);

    Ok(out)
}
