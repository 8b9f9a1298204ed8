//! SIP Digest Authentication, client side (RFC 2617 without qop)

use super::message::Challenge;
use std::fmt;

/// Computes the digest response for a challenge
#[cfg_attr(test, mockall::automock)]
pub trait DigestAuth: Send + Sync {
    /// Hex encoded `response` value for `method` on `uri`
    fn compute(&self, challenge: &Challenge, method: &str, uri: &str) -> String;

    /// Username placed in the Authorization header
    fn username(&self) -> String;

    /// Realm placed in the Authorization header
    fn realm(&self, challenge: &Challenge) -> String;
}

/// Account credentials
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    /// Used when the challenge carries no realm
    pub realm: Option<String>,
}

/// MD5 digest over account credentials
#[derive(Debug, Clone)]
pub struct Md5Digest {
    credentials: Credentials,
}

impl Md5Digest {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

impl DigestAuth for Md5Digest {
    fn compute(&self, challenge: &Challenge, method: &str, uri: &str) -> String {
        let realm = self.realm(challenge);
        let ha1 = md5_hex(&format!(
            "{}:{}:{}",
            self.credentials.username, realm, self.credentials.password
        ));
        let ha2 = md5_hex(&format!("{}:{}", method, uri));
        md5_hex(&format!("{}:{}:{}", ha1, challenge.nonce, ha2))
    }

    fn username(&self) -> String {
        self.credentials.username.clone()
    }

    fn realm(&self, challenge: &Challenge) -> String {
        challenge
            .realm
            .clone()
            .or_else(|| self.credentials.realm.clone())
            .unwrap_or_default()
    }
}

/// Credentials attached to a request after a 401/407
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthInfo {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
    pub opaque: Option<String>,
    /// Answering a 407 rather than a 401
    pub proxy: bool,
}

impl AuthInfo {
    /// Answer `challenge` for `method` on `uri`
    pub fn authorize(
        digest: &dyn DigestAuth,
        challenge: &Challenge,
        method: &str,
        uri: &str,
    ) -> Self {
        Self {
            username: digest.username(),
            realm: digest.realm(challenge),
            nonce: challenge.nonce.clone(),
            uri: uri.to_string(),
            response: digest.compute(challenge, method, uri),
            opaque: challenge.opaque.clone(),
            proxy: challenge.proxy,
        }
    }

    /// Same nonce, new method/uri (ACK, BYE in an authorized dialog)
    pub fn reauthorize(&self, digest: &dyn DigestAuth, method: &str, uri: &str) -> Self {
        let challenge = Challenge {
            realm: Some(self.realm.clone()),
            nonce: self.nonce.clone(),
            opaque: self.opaque.clone(),
            stale: false,
            proxy: self.proxy,
        };
        Self::authorize(digest, &challenge, method, uri)
    }

    pub fn header_name(&self) -> &'static str {
        if self.proxy {
            "Proxy-Authorization"
        } else {
            "Authorization"
        }
    }
}

impl fmt::Display for AuthInfo {
    /// Header value, without the header name
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            r#"Digest username="{}",realm="{}",nonce="{}",uri="{}",response="{}",algorithm=MD5"#,
            self.username, self.realm, self.nonce, self.uri, self.response
        )?;
        if let Some(opaque) = &self.opaque {
            write!(f, r#",opaque="{}""#, opaque)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> Credentials {
        Credentials {
            username: "Mufasa".to_string(),
            password: "Circle Of Life".to_string(),
            realm: None,
        }
    }

    fn challenge(realm: Option<&str>) -> Challenge {
        Challenge {
            realm: realm.map(str::to_string),
            nonce: "dcd98b7102dd2f0e8b11d0f600bfb0c093".to_string(),
            opaque: None,
            stale: false,
            proxy: false,
        }
    }

    #[test]
    fn test_rfc2617_example_without_qop() {
        let digest = Md5Digest::new(credentials());
        let response = digest.compute(
            &challenge(Some("testrealm@host.com")),
            "GET",
            "/dir/index.html",
        );

        let ha1 = md5_hex("Mufasa:testrealm@host.com:Circle Of Life");
        let ha2 = md5_hex("GET:/dir/index.html");
        assert_eq!(ha1, "939e7578ed9e3c518a452acee763bce9");
        assert_eq!(
            response,
            md5_hex(&format!("{}:dcd98b7102dd2f0e8b11d0f600bfb0c093:{}", ha1, ha2))
        );
        assert_eq!(response.len(), 32);
    }

    #[test]
    fn test_realm_falls_back_to_account() {
        let mut creds = credentials();
        creds.realm = Some("pbx.local".to_string());
        let digest = Md5Digest::new(creds);

        assert_eq!(digest.realm(&challenge(None)), "pbx.local");
        assert_eq!(digest.realm(&challenge(Some("asterisk"))), "asterisk");
    }

    #[test]
    fn test_auth_info_header_uses_mocked_digest() {
        let mut digest = MockDigestAuth::new();
        digest
            .expect_compute()
            .withf(|_, method, uri| method.to_string() == "REGISTER" && uri.to_string() == "sip:pbx.local")
            .times(1)
            .returning(|_, _, _| "abc123".to_string());
        digest.expect_username().returning(|| "100".to_string());
        digest.expect_realm().returning(|_| "asterisk".to_string());

        let mut ch = challenge(Some("asterisk"));
        ch.proxy = true;
        ch.opaque = Some("op".to_string());
        let info = AuthInfo::authorize(&digest, &ch, "REGISTER", "sip:pbx.local");

        assert_eq!(info.header_name(), "Proxy-Authorization");
        assert_eq!(
            info.to_string(),
            r#"Digest username="100",realm="asterisk",nonce="dcd98b7102dd2f0e8b11d0f600bfb0c093",uri="sip:pbx.local",response="abc123",algorithm=MD5,opaque="op""#
        );
    }

    #[test]
    fn test_reauthorize_keeps_nonce() {
        let digest = Md5Digest::new(credentials());
        let info = AuthInfo::authorize(&digest, &challenge(Some("r")), "INVITE", "sip:200@pbx");
        let ack = info.reauthorize(&digest, "ACK", "sip:200@pbx");

        assert_eq!(ack.nonce, info.nonce);
        assert_ne!(ack.response, info.response);
    }
}
