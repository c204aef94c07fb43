//! Message authentication for the Drover transport.
//!
//! Every envelope carries an opaque credential blob between the header and
//! the payload. The transport core only needs the operations of the
//! [`AuthPlugin`] contract: create, pack, unpack, verify, and identity
//! introspection. The default [`KeyedAuth`] plugin authenticates with a
//! BLAKE3 keyed MAC derived from a shared secret string; deployments with an
//! external authenticator supply their own plugin.
//!
//! Secret selection is flag-driven: messages carrying
//! [`flags::GLOBAL_AUTH_KEY`] are signed and verified with the process-wide
//! key, everything else with the default configured secret (the `authinfo`
//! option string, which doubles as the plugin's option channel).

mod error;

use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use drover_types::config::config;
use drover_types::flags;

pub use error::AuthError;

/// Key-derivation context for credential MACs.
const MAC_CONTEXT: &str = "drover 2025-04-02 message credential mac";

/// Packed credential size: index + uid + gid + created + MAC.
const CRED_BODY_LEN: usize = 4 + 4 + 4 + 8 + 32;

/// An unpacked authentication credential.
///
/// Opaque to the rest of the workspace; only [`AuthPlugin`] implementations
/// look inside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    index: u32,
    uid: u32,
    gid: u32,
    created: u64,
    mac: [u8; 32],
}

/// Contract over the pluggable authenticator.
pub trait AuthPlugin: Send + Sync {
    /// Create a credential for the calling process, signed with `secret`.
    fn create(&self, index: u32, secret: &str) -> Result<Credential, AuthError>;

    /// Append the credential's wire form to `buf`.
    fn pack(&self, cred: &Credential, buf: &mut BytesMut, version: u16);

    /// Parse a credential from the front of `buf`.
    fn unpack(&self, buf: &mut Bytes, version: u16) -> Result<Credential, AuthError>;

    /// Check the credential against `secret` and the configured TTL.
    fn verify(&self, cred: &Credential, secret: &str) -> Result<(), AuthError>;

    /// Identity of the credential's creator.
    fn uid(&self, cred: &Credential) -> u32;

    /// Plugin index the credential was created under.
    fn index_of(&self, cred: &Credential) -> u32;
}

// ---------------------------------------------------------------------------
// Default keyed-MAC plugin
// ---------------------------------------------------------------------------

/// Default authenticator: BLAKE3 keyed MAC over the credential body.
///
/// The MAC key is derived from the secret string, so two processes agree on
/// credentials iff they share the secret. The credential body carries the
/// creator's uid/gid and a creation timestamp checked against the TTL from
/// the `authinfo` options.
#[derive(Debug, Default)]
pub struct KeyedAuth;

impl KeyedAuth {
    fn mac(secret: &str, index: u32, uid: u32, gid: u32, created: u64) -> [u8; 32] {
        let key = blake3::derive_key(MAC_CONTEXT, secret.as_bytes());
        let mut body = [0u8; CRED_BODY_LEN - 32];
        body[0..4].copy_from_slice(&index.to_be_bytes());
        body[4..8].copy_from_slice(&uid.to_be_bytes());
        body[8..12].copy_from_slice(&gid.to_be_bytes());
        body[12..20].copy_from_slice(&created.to_be_bytes());
        *blake3::keyed_hash(&key, &body).as_bytes()
    }
}

impl AuthPlugin for KeyedAuth {
    fn create(&self, index: u32, secret: &str) -> Result<Credential, AuthError> {
        let (uid, gid) = process_ids();
        let created = unix_now();
        let mac = Self::mac(secret, index, uid, gid, created);
        Ok(Credential {
            index,
            uid,
            gid,
            created,
            mac,
        })
    }

    fn pack(&self, cred: &Credential, buf: &mut BytesMut, _version: u16) {
        buf.put_u32(CRED_BODY_LEN as u32);
        buf.put_u32(cred.index);
        buf.put_u32(cred.uid);
        buf.put_u32(cred.gid);
        buf.put_u64(cred.created);
        buf.put_slice(&cred.mac);
    }

    fn unpack(&self, buf: &mut Bytes, _version: u16) -> Result<Credential, AuthError> {
        if buf.remaining() < 4 {
            return Err(AuthError::Unpack("missing length prefix".to_string()));
        }
        let len = buf.get_u32() as usize;
        if len != CRED_BODY_LEN || buf.remaining() < len {
            return Err(AuthError::Unpack(format!(
                "bad credential length {len} (have {})",
                buf.remaining()
            )));
        }
        let index = buf.get_u32();
        let uid = buf.get_u32();
        let gid = buf.get_u32();
        let created = buf.get_u64();
        let mut mac = [0u8; 32];
        buf.copy_to_slice(&mut mac);
        Ok(Credential {
            index,
            uid,
            gid,
            created,
            mac,
        })
    }

    fn verify(&self, cred: &Credential, secret: &str) -> Result<(), AuthError> {
        verify_with_ttl(cred, secret, auth_ttl())
    }

    fn uid(&self, cred: &Credential) -> u32 {
        cred.uid
    }

    fn index_of(&self, cred: &Credential) -> u32 {
        cred.index
    }
}

/// MAC and TTL check with an explicit time-to-live.
fn verify_with_ttl(cred: &Credential, secret: &str, ttl: u32) -> Result<(), AuthError> {
    let expect = KeyedAuth::mac(secret, cred.index, cred.uid, cred.gid, cred.created);
    // Constant-time compare via blake3's Hash equality.
    if blake3::Hash::from(expect) != blake3::Hash::from(cred.mac) {
        return Err(AuthError::BadMac);
    }
    if ttl > 0 {
        let age = unix_now().saturating_sub(cred.created);
        if age > u64::from(ttl) {
            return Err(AuthError::Expired { age, ttl });
        }
    }
    Ok(())
}

/// The default plugin instance used by the transport when no replacement
/// has been installed.
pub fn default_plugin() -> &'static dyn AuthPlugin {
    static PLUGIN: KeyedAuth = KeyedAuth;
    &PLUGIN
}

// ---------------------------------------------------------------------------
// Secret selection
// ---------------------------------------------------------------------------

/// The process-wide auth key, cached on first access.
pub fn global_auth_key() -> &'static str {
    static KEY: OnceLock<String> = OnceLock::new();
    KEY.get_or_init(|| config().global_auth_key.clone())
}

/// The secret a message with the given flags is signed/verified with.
pub fn secret_for_flags(msg_flags: u16) -> String {
    if msg_flags & flags::GLOBAL_AUTH_KEY != 0 {
        global_auth_key().to_string()
    } else {
        config().authinfo.clone()
    }
}

// ---------------------------------------------------------------------------
// authinfo option parsing
// ---------------------------------------------------------------------------

/// Credential time-to-live from the `authinfo` options, cached on first
/// access. Zero means "no expiry".
pub fn auth_ttl() -> u32 {
    static TTL: OnceLock<u32> = OnceLock::new();
    *TTL.get_or_init(|| parse_auth_ttl(&config().authinfo))
}

/// Parse `ttl=<seconds>` out of an `authinfo` option string.
///
/// Negative and malformed values collapse to 0, as does a missing key.
/// Other `key=value` pairs (such as the `socket=` path an external
/// authenticator listens on) are left untouched for the plugin that
/// consumes the option string.
pub fn parse_auth_ttl(authinfo: &str) -> u32 {
    match authinfo_value(authinfo, "ttl") {
        Some(v) => v.parse::<i64>().unwrap_or(0).clamp(0, i64::from(u32::MAX)) as u32,
        None => 0,
    }
}

/// Look up one `key=value` pair in a comma-separated option string.
fn authinfo_value<'a>(authinfo: &'a str, key: &str) -> Option<&'a str> {
    authinfo.split(',').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k.trim() == key).then(|| v.trim())
    })
}

// ---------------------------------------------------------------------------
// Process identity
// ---------------------------------------------------------------------------

/// Real uid/gid of this process.
///
/// Read from `/proc/self` metadata; zero on platforms without it.
fn process_ids() -> (u32, u32) {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::fs::MetadataExt;
        if let Ok(meta) = std::fs::metadata("/proc/self") {
            return (meta.uid(), meta.gid());
        }
    }
    (0, 0)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_pack_unpack_roundtrip() {
        let plugin = KeyedAuth;
        let cred = plugin.create(0, "cluster-secret").unwrap();

        let mut buf = BytesMut::new();
        plugin.pack(&cred, &mut buf, 0x0c00);
        let mut wire = buf.freeze();
        let back = plugin.unpack(&mut wire, 0x0c00).unwrap();

        assert_eq!(cred, back);
        assert_eq!(wire.remaining(), 0, "unpack must consume the whole blob");
    }

    #[test]
    fn test_verify_matching_secret() {
        let plugin = KeyedAuth;
        let cred = plugin.create(0, "secret-a").unwrap();
        assert!(verify_with_ttl(&cred, "secret-a", 0).is_ok());
    }

    #[test]
    fn test_verify_wrong_secret() {
        let plugin = KeyedAuth;
        let cred = plugin.create(0, "secret-a").unwrap();
        let err = verify_with_ttl(&cred, "secret-b", 0).unwrap_err();
        assert!(matches!(err, AuthError::BadMac));
    }

    #[test]
    fn test_verify_ttl_expiry() {
        let plugin = KeyedAuth;
        let mut cred = plugin.create(0, "secret").unwrap();
        // Backdate the credential beyond the TTL and re-sign it so only
        // the age check can fail.
        cred.created -= 120;
        cred.mac = KeyedAuth::mac("secret", cred.index, cred.uid, cred.gid, cred.created);
        assert!(verify_with_ttl(&cred, "secret", 0).is_ok());
        let err = verify_with_ttl(&cred, "secret", 60).unwrap_err();
        assert!(matches!(err, AuthError::Expired { .. }));
    }

    #[test]
    fn test_unpack_truncated() {
        let plugin = KeyedAuth;
        let cred = plugin.create(0, "secret").unwrap();
        let mut buf = BytesMut::new();
        plugin.pack(&cred, &mut buf, 0x0c00);
        let full = buf.freeze();

        for cut in [0, 3, 4, 10, full.len() - 1] {
            let mut short = full.slice(..cut);
            assert!(
                plugin.unpack(&mut short, 0x0c00).is_err(),
                "truncation at {cut} must fail"
            );
        }
    }

    #[test]
    fn test_parse_auth_ttl() {
        assert_eq!(parse_auth_ttl("ttl=300"), 300);
        // Unrelated options around the key are skipped, not errors.
        assert_eq!(parse_auth_ttl("socket=/run/auth.sock,ttl=7"), 7);
        assert_eq!(parse_auth_ttl("ttl=-5"), 0);
        assert_eq!(parse_auth_ttl("ttl=junk"), 0);
        assert_eq!(parse_auth_ttl("socket=/run/auth.sock"), 0);
        assert_eq!(parse_auth_ttl(""), 0);
    }

    #[test]
    fn test_creator_identity() {
        let plugin = KeyedAuth;
        let cred = plugin.create(3, "secret").unwrap();
        assert_eq!(plugin.index_of(&cred), 3);
        // uid is whatever the test runs as; just check the accessor agrees
        // with the packed form.
        let mut buf = BytesMut::new();
        plugin.pack(&cred, &mut buf, 0x0c00);
        let mut wire = buf.freeze();
        let back = plugin.unpack(&mut wire, 0x0c00).unwrap();
        assert_eq!(plugin.uid(&back), plugin.uid(&cred));
    }
}
