use anyhow::Result;
use log::warn;
use rand::{rngs::OsRng, RngCore};

use super::{
    config::Config,
    rtsp::{Request, Response, StatusCode},
};

const REALM: &str = "taco";

/// Per-connection digest authentication state. The nonce is minted from the
/// system entropy source on first use and kept for the connection lifetime.
pub struct AuthGate {
    nonce: Option<String>,
}

impl AuthGate {
    pub fn new() -> Self {
        Self { nonce: None }
    }

    /// Checks one request. Returns true when it may proceed; otherwise the
    /// 401 challenge has been written into `response`.
    pub fn check(&mut self, config: &Config, request: &Request, response: &mut Response) -> Result<bool> {
        let password = match config.password.as_deref() {
            Some(password) => password,
            None => return Ok(true),
        };

        let fresh = self.nonce.is_none();
        let nonce = self.nonce.get_or_insert_with(make_nonce).clone();

        if !fresh && verify(request, password, &nonce) {
            return Ok(true);
        }

        response.status = StatusCode::Unauthorized;
        response
            .headers
            .add("WWW-Authenticate", format!("Digest realm=\"{}\", nonce=\"{}\"", REALM, nonce))?;

        Ok(false)
    }
}

fn verify(request: &Request, password: &str, nonce: &str) -> bool {
    let digest = match request
        .headers
        .get("Authorization")
        .and_then(|x| x.strip_prefix("Digest "))
    {
        Some(digest) => digest,
        None => return false,
    };

    let fields = (
        quoted_field(digest, "username"),
        quoted_field(digest, "realm"),
        quoted_field(digest, "response"),
        quoted_field(digest, "uri"),
    );
    match fields {
        (Some(username), Some(realm), Some(response), Some(uri)) => {
            let expected = digest_response(&request.method, username, realm, password, nonce, uri);
            if expected == response {
                true
            } else {
                warn!("auth failed");
                false
            }
        }
        _ => false,
    }
}

fn quoted_field<'a>(digest: &'a str, name: &str) -> Option<&'a str> {
    let start = digest.find(&format!("{}=\"", name))? + name.len() + 2;
    let rest = &digest[start..];

    Some(&rest[..rest.find('"')?])
}

// RFC 2617: MD5(MD5(user:realm:pass):nonce:MD5(method:uri)), hex upper-cased
fn digest_response(method: &str, username: &str, realm: &str, password: &str, nonce: &str, uri: &str) -> String {
    let urp = hex_upper(md5::compute(format!("{}:{}:{}", username, realm, password)));
    let mu = hex_upper(md5::compute(format!("{}:{}", method, uri)));

    hex_upper(md5::compute(format!("{}:{}:{}", urp, nonce, mu)))
}

fn hex_upper(digest: md5::Digest) -> String {
    digest.0.iter().map(|x| format!("{:02X}", x)).collect()
}

fn make_nonce() -> String {
    let mut random = [0u8; 8];
    OsRng.fill_bytes(&mut random);

    base64::encode(random)
}
