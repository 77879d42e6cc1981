//! Wire contract for resumable uploads.
//!
//! Header names, the protocol-version table, structured-boolean parsing
//! and idempotency-key hashing live here so that the server engine, the
//! axum adapters, and the client driver all agree on one definition.
//!
//! Several drafts of the protocol are in circulation.  They differ only in
//! a handful of header names and flag polarities, so instead of one engine
//! per draft there is a single [`ProtocolVersion`] value that looks up its
//! differences in [`VERSION_TABLE`].

use std::fmt;
use std::str::FromStr;

use http::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

// -- Header names -------------------------------------------------------------

/// Number of bytes the server has durably accepted.
pub const UPLOAD_OFFSET: &str = "upload-offset";

/// `?1` means more bytes follow (drafts up to 3).
pub const UPLOAD_INCOMPLETE: &str = "upload-incomplete";

/// `?1` means this request completes the upload (draft 4).
pub const UPLOAD_COMPLETE: &str = "upload-complete";

/// Draft interop version marker exchanged by both peers.
pub const INTEROP_VERSION: &str = "upload-draft-interop-version";

/// Client-supplied token used to deduplicate retried creation requests.
pub const IDEMPOTENCY_KEY: &str = "idempotency-key";

/// Status code of the provisional "upload resumption supported" response.
pub const PROVISIONAL_STATUS: u16 = 104;

// -- Upload state -------------------------------------------------------------

/// Authoritative `(offset, complete)` pair for one upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UploadState {
    /// Bytes durably accepted so far.
    pub offset: u64,
    /// Whether the upload has been declared complete.
    pub complete: bool,
}

impl UploadState {
    pub fn incomplete(offset: u64) -> Self {
        Self {
            offset,
            complete: false,
        }
    }
}

// -- Protocol versions --------------------------------------------------------

/// Protocol draft spoken by a peer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    /// Pre-interop servers and clients: no version header, `Upload-Incomplete`.
    Legacy,
    /// Interop version 3: `Upload-Incomplete`.
    #[default]
    Draft3,
    /// Interop version 4: `Upload-Complete` with inverted polarity.
    Draft4,
}

/// Per-version differences on the wire.
#[derive(Debug)]
pub struct VersionTraits {
    pub version: ProtocolVersion,
    /// Value of `Upload-Draft-Interop-Version`, if the draft defines one.
    pub interop: Option<&'static str>,
    /// Header carrying the completion declaration.
    pub completion_header: &'static str,
    /// True when `?1` in `completion_header` means "complete".
    pub flag_means_complete: bool,
}

pub static VERSION_TABLE: [VersionTraits; 3] = [
    VersionTraits {
        version: ProtocolVersion::Legacy,
        interop: None,
        completion_header: UPLOAD_INCOMPLETE,
        flag_means_complete: false,
    },
    VersionTraits {
        version: ProtocolVersion::Draft3,
        interop: Some("3"),
        completion_header: UPLOAD_INCOMPLETE,
        flag_means_complete: false,
    },
    VersionTraits {
        version: ProtocolVersion::Draft4,
        interop: Some("4"),
        completion_header: UPLOAD_COMPLETE,
        flag_means_complete: true,
    },
];

impl ProtocolVersion {
    pub fn traits(self) -> &'static VersionTraits {
        match self {
            ProtocolVersion::Legacy => &VERSION_TABLE[0],
            ProtocolVersion::Draft3 => &VERSION_TABLE[1],
            ProtocolVersion::Draft4 => &VERSION_TABLE[2],
        }
    }

    /// Value sent in `Upload-Draft-Interop-Version`, if any.
    pub fn interop_value(self) -> Option<&'static str> {
        self.traits().interop
    }

    /// Look up a version by its interop header value.
    pub fn from_interop(value: &str) -> Option<Self> {
        VERSION_TABLE
            .iter()
            .find(|t| t.interop == Some(value))
            .map(|t| t.version)
    }

    /// Detect the version a request was sent with.
    ///
    /// No interop header means a legacy peer.  Unknown values are not
    /// fatal: they are logged and answered in `fallback`.
    pub fn detect(headers: &HeaderMap, fallback: Self) -> Self {
        let Some(raw) = headers.get(INTEROP_VERSION) else {
            return ProtocolVersion::Legacy;
        };
        let value = raw.to_str().unwrap_or("").trim();
        match Self::from_interop(value) {
            Some(version) => version,
            None => {
                warn!(
                    interop_version = value,
                    fallback = %fallback,
                    "Unknown upload interop version, answering with default"
                );
                fallback
            }
        }
    }

    /// Identify the version a response was written in.
    ///
    /// A known interop value wins.  Without one, whichever completion
    /// header is present decides, so the flag is always read with the
    /// polarity the server meant.
    pub fn of_response(headers: &HeaderMap) -> Self {
        let declared = headers
            .get(INTEROP_VERSION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Self::from_interop(v.trim()));
        if let Some(version) = declared {
            return version;
        }
        if headers.contains_key(UPLOAD_COMPLETE) && !headers.contains_key(UPLOAD_INCOMPLETE) {
            ProtocolVersion::Draft4
        } else {
            ProtocolVersion::Legacy
        }
    }

    /// Read the client's completion declaration.
    ///
    /// Absence of the header always means "this request completes the
    /// upload"; only an explicit flag can keep it open.
    pub fn declares_complete(self, headers: &HeaderMap) -> bool {
        let traits = self.traits();
        let flag = headers
            .get(traits.completion_header)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_sf_bool);
        match (flag, traits.flag_means_complete) {
            (Some(flag), true) => flag,
            (Some(flag), false) => !flag,
            (None, _) => true,
        }
    }

    /// Write the completion declaration for an outgoing request.
    pub fn set_completion(self, headers: &mut HeaderMap, complete: bool) {
        let traits = self.traits();
        let flag = if traits.flag_means_complete {
            complete
        } else {
            !complete
        };
        headers.insert(traits.completion_header, sf_bool(flag));
    }

    /// Add the interop marker, if this version has one.
    pub fn set_interop(self, headers: &mut HeaderMap) {
        if let Some(value) = self.interop_value() {
            headers.insert(INTEROP_VERSION, HeaderValue::from_static(value));
        }
    }

    /// Write `Upload-Offset` and the completion header for `state`.
    pub fn set_state(self, headers: &mut HeaderMap, state: UploadState) {
        headers.insert(UPLOAD_OFFSET, HeaderValue::from(state.offset));
        self.set_completion(headers, state.complete);
    }

    /// Read the `(offset, complete)` pair a server reported.
    pub fn read_state(self, headers: &HeaderMap) -> Option<UploadState> {
        let offset = parse_offset(headers)?;
        Some(UploadState {
            offset,
            complete: self.declares_complete(headers),
        })
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolVersion::Legacy => "legacy",
            ProtocolVersion::Draft3 => "draft3",
            ProtocolVersion::Draft4 => "draft4",
        };
        f.write_str(name)
    }
}

impl FromStr for ProtocolVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "legacy" => Ok(ProtocolVersion::Legacy),
            "draft3" | "3" => Ok(ProtocolVersion::Draft3),
            "draft4" | "4" => Ok(ProtocolVersion::Draft4),
            other => Err(format!("unknown protocol version: {other}")),
        }
    }
}

// -- Field parsing ------------------------------------------------------------

/// Parse an RFC 8941 structured boolean (`?1` / `?0`).
pub fn parse_sf_bool(value: &str) -> Option<bool> {
    match value.trim() {
        "?1" => Some(true),
        "?0" => Some(false),
        _ => None,
    }
}

fn sf_bool(flag: bool) -> HeaderValue {
    HeaderValue::from_static(if flag { "?1" } else { "?0" })
}

/// Parse `Upload-Offset` as a non-negative decimal integer.
///
/// Returns `None` when the header is missing or malformed; signs and
/// whitespace inside the number are rejected.
pub fn parse_offset(headers: &HeaderMap) -> Option<u64> {
    let raw = headers.get(UPLOAD_OFFSET)?.to_str().ok()?.trim();
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok()
}

/// Hash a client idempotency token into the index key.
///
/// The raw token never reaches storage.
pub fn hash_idempotency_key(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Extract the idempotency token from request headers, ignoring empty values.
pub fn idempotency_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(IDEMPOTENCY_KEY)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_parse_offset_valid() {
        assert_eq!(parse_offset(&headers(&[(UPLOAD_OFFSET, "0")])), Some(0));
        assert_eq!(parse_offset(&headers(&[(UPLOAD_OFFSET, "1234")])), Some(1234));
    }

    #[test]
    fn test_parse_offset_rejects_garbage() {
        assert_eq!(parse_offset(&HeaderMap::new()), None);
        assert_eq!(parse_offset(&headers(&[(UPLOAD_OFFSET, "")])), None);
        assert_eq!(parse_offset(&headers(&[(UPLOAD_OFFSET, "-1")])), None);
        assert_eq!(parse_offset(&headers(&[(UPLOAD_OFFSET, "+5")])), None);
        assert_eq!(parse_offset(&headers(&[(UPLOAD_OFFSET, "12ab")])), None);
        assert_eq!(parse_offset(&headers(&[(UPLOAD_OFFSET, "1.5")])), None);
    }

    #[test]
    fn test_parse_sf_bool() {
        assert_eq!(parse_sf_bool("?1"), Some(true));
        assert_eq!(parse_sf_bool("?0"), Some(false));
        assert_eq!(parse_sf_bool("true"), None);
        assert_eq!(parse_sf_bool("1"), None);
    }

    #[test]
    fn test_detect_version() {
        let fallback = ProtocolVersion::Draft3;
        assert_eq!(
            ProtocolVersion::detect(&HeaderMap::new(), fallback),
            ProtocolVersion::Legacy
        );
        assert_eq!(
            ProtocolVersion::detect(&headers(&[(INTEROP_VERSION, "3")]), fallback),
            ProtocolVersion::Draft3
        );
        assert_eq!(
            ProtocolVersion::detect(&headers(&[(INTEROP_VERSION, "4")]), fallback),
            ProtocolVersion::Draft4
        );
        // Unknown versions fall back instead of failing.
        assert_eq!(
            ProtocolVersion::detect(&headers(&[(INTEROP_VERSION, "99")]), fallback),
            ProtocolVersion::Draft3
        );
    }

    #[test]
    fn test_declares_complete_incomplete_header() {
        let v = ProtocolVersion::Draft3;
        assert!(v.declares_complete(&HeaderMap::new()));
        assert!(v.declares_complete(&headers(&[(UPLOAD_INCOMPLETE, "?0")])));
        assert!(!v.declares_complete(&headers(&[(UPLOAD_INCOMPLETE, "?1")])));
        // Draft 3 ignores the draft 4 header.
        assert!(v.declares_complete(&headers(&[(UPLOAD_COMPLETE, "?0")])));
    }

    #[test]
    fn test_declares_complete_complete_header() {
        let v = ProtocolVersion::Draft4;
        assert!(v.declares_complete(&HeaderMap::new()));
        assert!(v.declares_complete(&headers(&[(UPLOAD_COMPLETE, "?1")])));
        assert!(!v.declares_complete(&headers(&[(UPLOAD_COMPLETE, "?0")])));
    }

    #[test]
    fn test_set_state_uses_version_header() {
        let mut h3 = HeaderMap::new();
        ProtocolVersion::Draft3.set_state(&mut h3, UploadState::incomplete(7));
        assert_eq!(h3.get(UPLOAD_OFFSET).unwrap(), "7");
        assert_eq!(h3.get(UPLOAD_INCOMPLETE).unwrap(), "?1");
        assert!(h3.get(UPLOAD_COMPLETE).is_none());

        let mut h4 = HeaderMap::new();
        ProtocolVersion::Draft4.set_state(
            &mut h4,
            UploadState {
                offset: 13,
                complete: true,
            },
        );
        assert_eq!(h4.get(UPLOAD_OFFSET).unwrap(), "13");
        assert_eq!(h4.get(UPLOAD_COMPLETE).unwrap(), "?1");
        assert!(h4.get(UPLOAD_INCOMPLETE).is_none());
    }

    #[test]
    fn test_read_state_requires_offset() {
        let v = ProtocolVersion::Draft3;
        assert_eq!(v.read_state(&headers(&[(UPLOAD_INCOMPLETE, "?1")])), None);
        assert_eq!(
            v.read_state(&headers(&[(UPLOAD_OFFSET, "5"), (UPLOAD_INCOMPLETE, "?1")])),
            Some(UploadState::incomplete(5))
        );
    }

    #[test]
    fn test_response_version_from_headers() {
        let draft3 = headers(&[
            (INTEROP_VERSION, "3"),
            (UPLOAD_OFFSET, "7"),
            (UPLOAD_INCOMPLETE, "?1"),
        ]);
        assert_eq!(ProtocolVersion::of_response(&draft3), ProtocolVersion::Draft3);

        let legacy = headers(&[(UPLOAD_OFFSET, "7"), (UPLOAD_INCOMPLETE, "?1")]);
        let version = ProtocolVersion::of_response(&legacy);
        assert_eq!(version, ProtocolVersion::Legacy);
        assert_eq!(version.read_state(&legacy), Some(UploadState::incomplete(7)));

        // No interop marker, but the completion header gives the draft away.
        let unmarked = headers(&[(UPLOAD_OFFSET, "7"), (UPLOAD_COMPLETE, "?0")]);
        assert_eq!(ProtocolVersion::of_response(&unmarked), ProtocolVersion::Draft4);

        let mangled = headers(&[
            (INTEROP_VERSION, "99"),
            (UPLOAD_OFFSET, "7"),
            (UPLOAD_INCOMPLETE, "?1"),
        ]);
        assert_eq!(ProtocolVersion::of_response(&mangled), ProtocolVersion::Legacy);
    }

    #[test]
    fn test_legacy_has_no_interop_header() {
        let mut h = HeaderMap::new();
        ProtocolVersion::Legacy.set_interop(&mut h);
        assert!(h.is_empty());
        ProtocolVersion::Draft4.set_interop(&mut h);
        assert_eq!(h.get(INTEROP_VERSION).unwrap(), "4");
    }

    #[test]
    fn test_version_from_str() {
        assert_eq!("draft4".parse::<ProtocolVersion>(), Ok(ProtocolVersion::Draft4));
        assert_eq!("3".parse::<ProtocolVersion>(), Ok(ProtocolVersion::Draft3));
        assert!("draft9".parse::<ProtocolVersion>().is_err());
    }

    #[test]
    fn test_hash_idempotency_key() {
        let hash = hash_idempotency_key("abc");
        assert_eq!(
            hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_ne!(hash_idempotency_key("abd"), hash);
    }

    #[test]
    fn test_idempotency_key_ignores_empty() {
        assert_eq!(idempotency_key(&headers(&[(IDEMPOTENCY_KEY, "  ")])), None);
        assert_eq!(
            idempotency_key(&headers(&[(IDEMPOTENCY_KEY, "token-1")])),
            Some("token-1".to_string())
        );
    }
}
