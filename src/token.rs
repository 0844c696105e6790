//! Shared access signature tokens
//!
//! The signature is computed as
//! `lower_escapes(url_encode(utf8(base64(hmac_sha256(base64_decode(key), uri + "\n" + expiry)))))`.
//! Device tokens sign the resource URI as given; service tokens sign the
//! lower-cased, URL encoded host name and carry the policy name in `skn`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS, NON_ALPHANUMERIC};
use sha2::Sha256;

use crate::error::{Error, Result};

const TOKEN_PREFIX: &str = "SharedAccessSignature ";

/// Characters left untouched by the web-safe encoding: `A-Z a-z 0-9 . - * _`
const WEB_SAFE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'.')
    .remove(b'-')
    .remove(b'*')
    .remove(b'_');

/// Escapes applied to a device resource URI before it is signed
const RESOURCE_URI: &AsciiSet = &CONTROLS.add(b'/');

/// Default validity of a device token
pub const DEFAULT_DEVICE_TOKEN_VALIDITY_SECS: i64 = 3600;
/// Default validity of a service token
pub const DEFAULT_SERVICE_TOKEN_VALIDITY_SECS: i64 = 365 * 24 * 3600;

fn build_raw_signature(resource_uri: &str, expiry: i64) -> Vec<u8> {
    format!("{}\n{}", resource_uri, expiry).into_bytes()
}

fn decode_key_base64(key: &str) -> Result<Vec<u8>> {
    let decoded = base64::decode(key)
        .map_err(|e| Error::Authentication(format!("access key is not valid base64: {}", e)))?;
    if decoded.is_empty() {
        return Err(Error::Authentication("access key is empty".to_owned()));
    }
    Ok(decoded)
}

fn encrypt_signature_hmac_sha256(raw: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)
        .map_err(|e| Error::Authentication(format!("unusable access key: {}", e)))?;
    mac.update(raw);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn encode_signature_base64(digest: &[u8]) -> Vec<u8> {
    base64::encode(digest).into_bytes()
}

fn encode_signature_utf8(b64: Vec<u8>) -> Result<String> {
    String::from_utf8(b64).map_err(|e| Error::Authentication(e.to_string()))
}

fn encode_signature_web_safe(signature: &str) -> String {
    utf8_percent_encode(signature, WEB_SAFE).to_string()
}

fn lowercase_escapes(encoded: &str) -> String {
    let mut out = String::with_capacity(encoded.len());
    let mut hex_digits_left = 0;
    for c in encoded.chars() {
        if hex_digits_left > 0 {
            out.push(c.to_ascii_lowercase());
            hex_digits_left -= 1;
        } else {
            if c == '%' {
                hex_digits_left = 2;
            }
            out.push(c);
        }
    }
    out
}

/// Keyed digest over a resource URI and expiry
#[derive(Clone, PartialEq, Eq)]
pub struct Signature {
    sig: String,
}

impl Signature {
    /// Compute the signature for `resource_uri` expiring at `expiry` (unix seconds)
    pub fn new(resource_uri: &str, expiry: i64, key: &str) -> Result<Self> {
        let raw = build_raw_signature(resource_uri, expiry);
        let key = decode_key_base64(key)?;
        let digest = encrypt_signature_hmac_sha256(&raw, &key)?;
        let b64 = encode_signature_base64(&digest);
        let utf8 = encode_signature_utf8(b64)?;
        let web_safe = encode_signature_web_safe(&utf8);
        Ok(Self {
            sig: lowercase_escapes(&web_safe),
        })
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sig)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Signature(..)")
    }
}

/// Bearer credential presented to the hub
#[derive(Clone, PartialEq, Eq)]
pub struct SasToken {
    resource_uri: String,
    signature: String,
    expiry: i64,
    key_name: Option<String>,
}

impl SasToken {
    /// Assemble a token from its parts
    pub fn new(
        resource_uri: impl Into<String>,
        signature: impl ToString,
        expiry: i64,
        key_name: Option<String>,
    ) -> Self {
        Self {
            resource_uri: resource_uri.into(),
            signature: signature.to_string(),
            expiry,
            key_name,
        }
    }

    /// Resource the token grants access to
    pub fn resource_uri(&self) -> &str {
        &self.resource_uri
    }

    /// Expiry in unix seconds
    pub fn expiry(&self) -> i64 {
        self.expiry
    }

    /// Policy name, for service tokens
    pub fn key_name(&self) -> Option<&str> {
        self.key_name.as_deref()
    }

    /// A token is no longer valid once `now >= expiry`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() >= self.expiry
    }
}

impl fmt::Display for SasToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}sr={}&sig={}&se={}",
            TOKEN_PREFIX, self.resource_uri, self.signature, self.expiry
        )?;
        if let Some(key_name) = &self.key_name {
            write!(f, "&skn={}", key_name)?;
        }
        Ok(())
    }
}

impl fmt::Debug for SasToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SasToken")
            .field("resource_uri", &self.resource_uri)
            .field("expiry", &self.expiry)
            .field("key_name", &self.key_name)
            .finish()
    }
}

impl FromStr for SasToken {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let fields = s.trim().strip_prefix(TOKEN_PREFIX).ok_or_else(|| {
            Error::Authentication(format!("token must start with `{}`", TOKEN_PREFIX.trim()))
        })?;

        let mut resource_uri = None;
        let mut signature = None;
        let mut expiry = None;
        let mut key_name = None;
        for field in fields.split('&') {
            match field.split_once('=') {
                Some(("sr", v)) => resource_uri = Some(v.to_owned()),
                Some(("sig", v)) => signature = Some(v.to_owned()),
                Some(("se", v)) => {
                    expiry = Some(v.parse::<i64>().map_err(|_| {
                        Error::Authentication(format!("invalid token expiry `{}`", v))
                    })?)
                }
                Some(("skn", v)) => key_name = Some(v.to_owned()),
                // Ignore fields the hub may add in the future
                _ => (),
            }
        }

        match (resource_uri, signature, expiry) {
            (Some(resource_uri), Some(signature), Some(expiry)) => Ok(Self {
                resource_uri,
                signature,
                expiry,
                key_name,
            }),
            _ => Err(Error::Authentication(
                "token is missing one of sr, sig or se".to_owned(),
            )),
        }
    }
}

/// Produces tokens that are valid until a requested expiry
pub trait TokenSource: fmt::Debug + Send + Sync {
    ///
    fn get(&self, expiry: &DateTime<Utc>) -> Result<SasToken>;
}

/// A pre-generated token; the requested expiry is ignored
#[derive(Debug, Clone)]
pub struct SasTokenSource {
    token: SasToken,
}

impl SasTokenSource {
    ///
    pub fn new(sas: &str) -> Result<Self> {
        Ok(Self { token: sas.parse()? })
    }
}

impl TokenSource for SasTokenSource {
    fn get(&self, _: &DateTime<Utc>) -> Result<SasToken> {
        Ok(self.token.clone())
    }
}

/// Signs device tokens with the device's symmetric key
#[derive(Clone)]
pub struct DeviceKeyTokenSource {
    resource_uri: String,
    key: String,
}

impl DeviceKeyTokenSource {
    ///
    pub fn new(hub: &str, device_id: &str, key: &str) -> Result<Self> {
        if hub.is_empty() || device_id.is_empty() {
            return Err(Error::Authentication(
                "hub name and device id are required".to_owned(),
            ));
        }
        decode_key_base64(key)?;

        let resource_uri = format!("{}/devices/{}", hub, device_id);
        Ok(Self {
            resource_uri: utf8_percent_encode(&resource_uri, RESOURCE_URI).to_string(),
            key: key.to_owned(),
        })
    }
}

impl fmt::Debug for DeviceKeyTokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceKeyTokenSource")
            .field("resource_uri", &self.resource_uri)
            .finish()
    }
}

impl TokenSource for DeviceKeyTokenSource {
    fn get(&self, expiry: &DateTime<Utc>) -> Result<SasToken> {
        let expiry = expiry.timestamp();
        let signature = Signature::new(&self.resource_uri, expiry, &self.key)?;
        let token = SasToken::new(self.resource_uri.as_str(), signature, expiry, None);

        trace!("Using device key token: {:?}", token);

        Ok(token)
    }
}

/// Signs service tokens with a shared access policy key
#[derive(Clone)]
pub struct ServiceSasTokenSource {
    target_uri: String,
    key_name: String,
    key: String,
}

impl ServiceSasTokenSource {
    ///
    pub fn new(hostname: &str, key_name: &str, key: &str) -> Result<Self> {
        if hostname.is_empty() || key_name.is_empty() {
            return Err(Error::Authentication(
                "host name and policy name are required".to_owned(),
            ));
        }
        decode_key_base64(key)?;

        Ok(Self {
            target_uri: encode_signature_web_safe(hostname).to_lowercase(),
            key_name: key_name.to_owned(),
            key: key.to_owned(),
        })
    }
}

impl fmt::Debug for ServiceSasTokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceSasTokenSource")
            .field("target_uri", &self.target_uri)
            .field("key_name", &self.key_name)
            .finish()
    }
}

impl TokenSource for ServiceSasTokenSource {
    fn get(&self, expiry: &DateTime<Utc>) -> Result<SasToken> {
        let expiry = expiry.timestamp();
        let signature = Signature::new(&self.target_uri, expiry, &self.key)?;
        Ok(SasToken::new(
            self.target_uri.as_str(),
            signature,
            expiry,
            Some(self.key_name.clone()),
        ))
    }
}

/// Caches a token and mints a new one when the current one nears expiry
///
/// There is no background timer; renewal happens on the next call to
/// [`TokenRenewal::token`].
#[derive(Debug)]
pub struct TokenRenewal {
    source: Arc<dyn TokenSource>,
    validity: Duration,
    current: Option<SasToken>,
    /// The source could not produce a token outside the renewal margin,
    /// so the current one is kept until it actually expires
    exhausted: bool,
}

impl TokenRenewal {
    ///
    pub fn new(source: Arc<dyn TokenSource>, validity: Duration) -> Self {
        Self {
            source,
            validity,
            current: None,
            exhausted: false,
        }
    }

    fn margin(&self) -> Duration {
        self.validity / 10
    }

    /// Whether the cached token must be replaced before use at `now`
    pub fn needs_renewal(&self, now: DateTime<Utc>) -> bool {
        match &self.current {
            Some(token) if self.exhausted => token.is_expired(now),
            Some(token) => token.is_expired(now + self.margin()),
            None => true,
        }
    }

    /// Token valid at `now`, minting a new one if required
    pub fn token(&mut self, now: DateTime<Utc>) -> Result<&SasToken> {
        if self.needs_renewal(now) {
            let expiry = now + self.validity;
            trace!("Generating token that will expire at {}", expiry);
            let token = self.source.get(&expiry)?;
            if token.is_expired(now) {
                let expired_at = Utc.timestamp_opt(token.expiry(), 0).single();
                return Err(Error::Authentication(format!(
                    "token source returned a token that expired at {:?}",
                    expired_at
                )));
            }
            self.exhausted = token.is_expired(now + self.margin());
            if self.exhausted {
                debug!(
                    "Token source cannot renew before {}, keeping current token",
                    token.expiry()
                );
            }
            self.current = Some(token);
        }

        self.current
            .as_ref()
            .ok_or_else(|| Error::Authentication("no token available".to_owned()))
    }

    /// Drop the cached token so the next call mints a fresh one
    pub fn invalidate(&mut self) {
        self.current = None;
        self.exhausted = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "O+H9VTcdJP0Tqkl7bh4nVG0OJNrAataMpuWB54D0VEc=";

    #[test]
    fn raw_signature_joins_uri_and_expiry_with_newline() {
        assert_eq!(
            build_raw_signature("test-resource-uri", 101),
            b"test-resource-uri\n101".to_vec()
        );
    }

    #[test]
    fn web_safe_encoding_then_lowercase_escapes() {
        let web_safe = encode_signature_web_safe("a+b/c=");
        assert_eq!(web_safe, "a%2Bb%2Fc%3D");
        assert_eq!(lowercase_escapes(&web_safe), "a%2bb%2fc%3d");
        assert_eq!(lowercase_escapes("ABC%3D"), "ABC%3d");
    }

    #[test]
    fn signature_for_simple_resource() {
        let sig = Signature::new("test-resource-uri", 101, "dGVzdC1kZXZpY2Uta2V5").unwrap();
        assert_eq!(
            sig.to_string(),
            "pARyjCbfaTLsaOXe5zaJBekDFvB16fkwcnK71mLguUs%3d"
        );
    }

    #[test]
    fn signature_matches_hub_vector() {
        let sig = Signature::new(
            "sdktesthub.private.azure-devices-int.net/devices/test8",
            1_462_333_672,
            "q+DKVojmMz014RjAwpNGZbAkdOocSVWMKPOccLfUmLE=",
        )
        .unwrap();
        assert!(sig
            .to_string()
            .eq_ignore_ascii_case("ZrTYgp6uRmbDl4lzzewxFD9FoaNKIK7G2bdivDbtc9A%3D"));
    }

    #[test]
    fn malformed_key_is_rejected() {
        assert!(matches!(
            Signature::new("test-resource-uri", 101, "test-device-key"),
            Err(Error::Authentication(_))
        ));
        assert!(matches!(
            DeviceKeyTokenSource::new("hub", "device", ""),
            Err(Error::Authentication(_))
        ));
        assert!(DeviceKeyTokenSource::new("hub", "", KEY).is_err());
    }

    #[test]
    fn device_token_format() {
        let source =
            DeviceKeyTokenSource::new("myiothub.azure-devices.net", "FirstDevice", KEY).unwrap();
        let expiry = Utc.timestamp_opt(1_587_123_309, 0).unwrap();
        assert_eq!(
            source.get(&expiry).unwrap().to_string(),
            "SharedAccessSignature sr=myiothub.azure-devices.net%2Fdevices%2FFirstDevice&sig=vn0%2bgyIUKgaBhEU0ypyOhJ0gPK5fSY1TKdvcJ1HxhnQ%3d&se=1587123309"
        );
    }

    #[test]
    fn service_token_lowercases_uri_and_names_policy() {
        let source =
            ServiceSasTokenSource::new("HubName.azure-devices.net", "iothubowner", KEY).unwrap();
        let expiry = Utc.timestamp_opt(1_587_123_309, 0).unwrap();
        assert_eq!(
            source.get(&expiry).unwrap().to_string(),
            "SharedAccessSignature sr=hubname.azure-devices.net&sig=TPy0U5r0Gax4yTR37zkRY0fikrxmOVHenS3JzLvj5Fc%3d&se=1587123309&skn=iothubowner"
        );
    }

    #[test]
    fn parse_token() {
        let token: SasToken = "SharedAccessSignature sr=hub%2fdevices%2fd1&sig=abc%3d&se=42&skn=owner"
            .parse()
            .unwrap();
        assert_eq!(token.resource_uri(), "hub%2fdevices%2fd1");
        assert_eq!(token.expiry(), 42);
        assert_eq!(token.key_name(), Some("owner"));
        assert!(token.is_expired(Utc.timestamp_opt(42, 0).unwrap()));
        assert!(!token.is_expired(Utc.timestamp_opt(41, 0).unwrap()));

        assert!("sr=a&sig=b&se=1".parse::<SasToken>().is_err());
        assert!("SharedAccessSignature sr=a&se=1".parse::<SasToken>().is_err());
    }

    #[test]
    fn renewal_reuses_token_until_margin() {
        let source = DeviceKeyTokenSource::new("hub", "device", KEY).unwrap();
        let mut renewal = TokenRenewal::new(Arc::new(source), Duration::seconds(3600));
        let now = Utc.timestamp_opt(1_000_000, 0).unwrap();

        assert!(renewal.needs_renewal(now));
        let first = renewal.token(now).unwrap().clone();
        assert_eq!(first.expiry(), 1_003_600);

        let later = now + Duration::seconds(3000);
        assert_eq!(renewal.token(later).unwrap(), &first);

        let near_expiry = now + Duration::seconds(3300);
        assert!(renewal.needs_renewal(near_expiry));
        assert_eq!(renewal.token(near_expiry).unwrap().expiry(), 1_006_900);
    }

    #[test]
    fn renewal_refuses_expired_fixed_token() {
        let source = SasTokenSource::new("SharedAccessSignature sr=a&sig=b&se=10").unwrap();
        let mut renewal = TokenRenewal::new(Arc::new(source), Duration::seconds(3600));
        assert!(renewal.token(Utc.timestamp_opt(20, 0).unwrap()).is_err());
    }

    #[test]
    fn fixed_token_near_expiry_is_kept_until_it_lapses() {
        let source =
            SasTokenSource::new("SharedAccessSignature sr=a&sig=b&se=1000120").unwrap();
        let mut renewal = TokenRenewal::new(Arc::new(source), Duration::seconds(3600));
        let now = Utc.timestamp_opt(1_000_000, 0).unwrap();

        assert_eq!(renewal.token(now).unwrap().expiry(), 1_000_120);
        assert!(!renewal.needs_renewal(now));
        assert!(!renewal.needs_renewal(now + Duration::seconds(119)));
        assert!(renewal.needs_renewal(now + Duration::seconds(120)));

        renewal.invalidate();
        assert!(renewal.needs_renewal(now));
    }
}
