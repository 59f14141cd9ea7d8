//! Cookie parsing, serialization and signing.
//!
//! Signed values use the `value.signature` layout, where the signature is
//! the unpadded base64 HMAC-SHA256 of the value. Several secrets may be
//! configured to rotate keys: the first one signs, all of them verify, and a
//! value verified by an older secret is reported as needing renewal.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use hmac::{Hmac, Mac};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Characters `encodeURIComponent` leaves alone.
const COOKIE_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl SameSite {
    fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "Strict",
            Self::Lax    => "Lax",
            Self::None   => "None",
        }
    }
}

/// Attributes of an outgoing cookie, plus the jar's signing secrets.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct CookieOptions {
    /// Signing secrets, newest first. Accepts a single string in config files.
    #[serde(deserialize_with = "one_or_many")]
    pub secret: Vec<String>,
    /// Sign the value with the first secret.
    pub signed: bool,
    pub domain: Option<String>,
    pub path: Option<String>,
    /// `Max-Age` in seconds.
    pub max_age: Option<u64>,
    #[serde(skip)]
    pub expires: Option<SystemTime>,
    pub http_only: bool,
    pub secure: bool,
    pub same_site: Option<SameSite>,
}

fn one_or_many<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(de)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

/// Parses a `Cookie` request header. The first occurrence of a name wins.
pub fn parse_cookie_header(raw: &str) -> HashMap<String, String> {
    let mut cookies = HashMap::new();
    for pair in raw.split(';') {
        let Some((name, value)) = pair.split_once('=') else { continue };
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        let decoded = percent_decode_str(value).decode_utf8_lossy().into_owned();
        cookies.entry(name.to_owned()).or_insert(decoded);
    }
    cookies
}

/// Renders a `Set-Cookie` header value.
pub fn serialize(name: &str, value: &str, opts: &CookieOptions) -> String {
    let mut out = format!("{name}={}", utf8_percent_encode(value, COOKIE_VALUE));
    if let Some(max_age) = opts.max_age {
        out.push_str(&format!("; Max-Age={max_age}"));
    }
    if let Some(domain) = &opts.domain {
        out.push_str(&format!("; Domain={domain}"));
    }
    if let Some(path) = &opts.path {
        out.push_str(&format!("; Path={path}"));
    }
    if let Some(expires) = opts.expires {
        out.push_str(&format!("; Expires={}", httpdate::fmt_http_date(expires)));
    }
    if opts.http_only {
        out.push_str("; HttpOnly");
    }
    if opts.secure {
        out.push_str("; Secure");
    }
    if let Some(same_site) = opts.same_site {
        out.push_str(&format!("; SameSite={}", same_site.as_str()));
    }
    out
}

/// Result of verifying a signed cookie value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Unsigned {
    pub valid: bool,
    /// Verified by a secret other than the first one; re-sign before it rotates out.
    pub renew: bool,
    pub value: Option<String>,
}

/// Signs with the first secret, verifies against all of them.
#[derive(Clone, Debug)]
pub struct Signer {
    secrets: Vec<String>,
}

impl Signer {
    /// Returns `None` when no secret is configured.
    pub fn new(secrets: &[String]) -> Option<Self> {
        (!secrets.is_empty()).then(|| Self { secrets: secrets.to_vec() })
    }

    fn mac(secret: &str, value: &str) -> HmacSha256 {
        // HMAC accepts keys of any length.
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .unwrap_or_else(|_| unreachable!("hmac key of any size"));
        mac.update(value.as_bytes());
        mac
    }

    pub fn sign(&self, value: &str) -> String {
        let tag = Self::mac(&self.secrets[0], value).finalize().into_bytes();
        format!("{value}.{}", STANDARD_NO_PAD.encode(tag))
    }

    pub fn unsign(&self, signed: &str) -> Unsigned {
        let rejected = Unsigned { valid: false, renew: false, value: None };
        let Some((value, signature)) = signed.rsplit_once('.') else { return rejected };
        let Ok(tag) = STANDARD_NO_PAD.decode(signature) else { return rejected };

        for (i, secret) in self.secrets.iter().enumerate() {
            if Self::mac(secret, value).verify_slice(&tag).is_ok() {
                return Unsigned { valid: true, renew: i != 0, value: Some(value.to_owned()) };
            }
        }
        rejected
    }
}

/// Per-flow cookie state: outgoing `Set-Cookie` lines and the signer.
#[derive(Clone, Debug, Default)]
pub(crate) struct CookieJar {
    options: CookieOptions,
    signer: Option<Signer>,
    outgoing: Vec<String>,
}

impl CookieJar {
    pub(crate) fn new(options: CookieOptions) -> Self {
        let signer = Signer::new(&options.secret);
        Self { options, signer, outgoing: Vec::new() }
    }

    pub(crate) fn set(&mut self, name: &str, value: &str, opts: Option<&CookieOptions>) {
        let opts = opts.unwrap_or(&self.options);
        let signed;
        let value = if opts.signed {
            let signer = Signer::new(&opts.secret).or_else(|| self.signer.clone());
            match signer {
                Some(signer) => {
                    signed = signer.sign(value);
                    signed.as_str()
                }
                None => {
                    tracing::warn!(cookie = name, "signed cookie requested without a secret, sending unsigned");
                    value
                }
            }
        } else {
            value
        };
        let line = serialize(name, value, opts);
        self.outgoing.push(line);
    }

    pub(crate) fn clear(&mut self, name: &str, opts: Option<&CookieOptions>) {
        let base = opts.unwrap_or(&self.options);
        let opts = CookieOptions {
            path: base.path.clone().or_else(|| Some("/".to_owned())),
            expires: Some(UNIX_EPOCH + Duration::from_millis(1)),
            signed: false,
            max_age: None,
            ..base.clone()
        };
        self.set(name, "", Some(&opts));
    }

    pub(crate) fn unsign(&self, value: &str) -> Option<Unsigned> {
        match &self.signer {
            Some(signer) => Some(signer.unsign(value)),
            None => {
                tracing::error!("no signer configured for cookies, unsign is unavailable");
                None
            }
        }
    }

    pub(crate) fn outgoing(&self) -> &[String] {
        &self.outgoing
    }
}
