//! Content identity locator of a swarm: the swarm id plus the options a peer needs to join,
//!  e.g. `magnet:?xt=urn:ppspp:<id>&x.cs=1024&x.cps=64&x.sc=16&x.im=2&x.htf=2&x.lsa=1&x.lw=16384`

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use url::Url;

use crate::config::SwarmOptions;
use crate::integrity::{LiveSignatureAlgorithm, MerkleHashTreeFunction, ProtectionMethod, VerifierOptions};
use crate::swarm::SwarmId;

const SCHEME: &str = "magnet";
const URN_PREFIX: &str = "urn:ppspp:";

const CHUNK_SIZE: &str = "x.cs";
const CHUNKS_PER_SIGNATURE: &str = "x.cps";
const STREAM_COUNT: &str = "x.sc";
const PROTECTION_METHOD: &str = "x.im";
const HASH_TREE_FUNCTION: &str = "x.htf";
const SIGNATURE_ALGORITHM: &str = "x.lsa";
const LIVE_WINDOW: &str = "x.lw";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UriError {
    #[error(transparent)]
    Malformed(#[from] url::ParseError),
    #[error("unsupported scheme {0}")]
    UnsupportedScheme(String),
    #[error("missing swarm id")]
    MissingSwarmId,
    #[error("invalid swarm id: {0}")]
    InvalidSwarmId(String),
    #[error("missing parameter {0}")]
    MissingParameter(&'static str),
    #[error("invalid value {value:?} for {name}")]
    InvalidParameter { name: &'static str, value: String },
}

/// The swarm options that are part of a swarm's identity
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwarmUriOptions {
    pub chunk_size: usize,
    pub chunks_per_signature: usize,
    pub stream_count: usize,
    pub integrity: VerifierOptions,
    pub live_window: usize,
}

impl From<&SwarmOptions> for SwarmUriOptions {
    fn from(options: &SwarmOptions) -> Self {
        SwarmUriOptions {
            chunk_size: options.chunk_size,
            chunks_per_signature: options.chunks_per_signature,
            stream_count: options.stream_count,
            integrity: options.integrity,
            live_window: options.live_window,
        }
    }
}

impl SwarmUriOptions {
    /// Swarm options for joining the swarm, local settings taken from `base`
    pub fn swarm_options(&self, base: SwarmOptions) -> SwarmOptions {
        SwarmOptions {
            chunk_size: self.chunk_size,
            chunks_per_signature: self.chunks_per_signature,
            stream_count: self.stream_count,
            integrity: self.integrity,
            live_window: self.live_window,
            ..base
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SwarmUri {
    pub id: SwarmId,
    pub options: SwarmUriOptions,
}

impl SwarmUri {
    pub fn new(id: SwarmId, options: &SwarmOptions) -> SwarmUri {
        SwarmUri {
            id,
            options: options.into(),
        }
    }

    pub fn parse(s: &str) -> Result<SwarmUri, UriError> {
        let url = Url::parse(s)?;
        if url.scheme() != SCHEME {
            return Err(UriError::UnsupportedScheme(url.scheme().to_string()));
        }

        let mut id = None;
        let mut params = Params::default();
        for (k, v) in url.query_pairs() {
            match k.as_ref() {
                "xt" => {
                    let encoded = v.strip_prefix(URN_PREFIX)
                        .ok_or_else(|| UriError::InvalidSwarmId(v.to_string()))?;
                    let bytes = URL_SAFE_NO_PAD.decode(encoded)
                        .map_err(|e| UriError::InvalidSwarmId(e.to_string()))?;
                    id = Some(SwarmId::from(bytes));
                }
                CHUNK_SIZE => params.chunk_size = Some(parse_param(CHUNK_SIZE, &v)?),
                CHUNKS_PER_SIGNATURE => params.chunks_per_signature = Some(parse_param(CHUNKS_PER_SIGNATURE, &v)?),
                STREAM_COUNT => params.stream_count = Some(parse_param(STREAM_COUNT, &v)?),
                PROTECTION_METHOD => params.protection_method = Some(parse_enum_param(PROTECTION_METHOD, &v)?),
                HASH_TREE_FUNCTION => params.hash_tree_function = Some(parse_enum_param(HASH_TREE_FUNCTION, &v)?),
                SIGNATURE_ALGORITHM => params.signature_algorithm = Some(parse_enum_param(SIGNATURE_ALGORITHM, &v)?),
                LIVE_WINDOW => params.live_window = Some(parse_param(LIVE_WINDOW, &v)?),
                _ => {}
            }
        }

        Ok(SwarmUri {
            id: id.ok_or(UriError::MissingSwarmId)?,
            options: params.finish()?,
        })
    }
}

impl Display for SwarmUri {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let o = &self.options;
        write!(f, "{}:?xt={}{}", SCHEME, URN_PREFIX, URL_SAFE_NO_PAD.encode(self.id.as_bytes()))?;
        write!(f, "&{}={}", CHUNK_SIZE, o.chunk_size)?;
        write!(f, "&{}={}", CHUNKS_PER_SIGNATURE, o.chunks_per_signature)?;
        write!(f, "&{}={}", STREAM_COUNT, o.stream_count)?;
        write!(f, "&{}={}", PROTECTION_METHOD, u8::from(o.integrity.protection_method))?;
        write!(f, "&{}={}", HASH_TREE_FUNCTION, u8::from(o.integrity.hash_tree_function))?;
        write!(f, "&{}={}", SIGNATURE_ALGORITHM, u8::from(o.integrity.signature_algorithm))?;
        write!(f, "&{}={}", LIVE_WINDOW, o.live_window)
    }
}

impl FromStr for SwarmUri {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SwarmUri::parse(s)
    }
}

#[derive(Default)]
struct Params {
    chunk_size: Option<usize>,
    chunks_per_signature: Option<usize>,
    stream_count: Option<usize>,
    protection_method: Option<ProtectionMethod>,
    hash_tree_function: Option<MerkleHashTreeFunction>,
    signature_algorithm: Option<LiveSignatureAlgorithm>,
    live_window: Option<usize>,
}

impl Params {
    fn finish(self) -> Result<SwarmUriOptions, UriError> {
        Ok(SwarmUriOptions {
            chunk_size: self.chunk_size.ok_or(UriError::MissingParameter(CHUNK_SIZE))?,
            chunks_per_signature: self.chunks_per_signature.ok_or(UriError::MissingParameter(CHUNKS_PER_SIGNATURE))?,
            stream_count: self.stream_count.ok_or(UriError::MissingParameter(STREAM_COUNT))?,
            integrity: VerifierOptions {
                protection_method: self.protection_method.ok_or(UriError::MissingParameter(PROTECTION_METHOD))?,
                hash_tree_function: self.hash_tree_function.ok_or(UriError::MissingParameter(HASH_TREE_FUNCTION))?,
                signature_algorithm: self.signature_algorithm.ok_or(UriError::MissingParameter(SIGNATURE_ALGORITHM))?,
            },
            live_window: self.live_window.ok_or(UriError::MissingParameter(LIVE_WINDOW))?,
        })
    }
}

fn parse_param(name: &'static str, value: &str) -> Result<usize, UriError> {
    value.parse()
        .map_err(|_| UriError::InvalidParameter { name, value: value.to_string() })
}

fn parse_enum_param<T: TryFrom<u8>>(name: &'static str, value: &str) -> Result<T, UriError> {
    value.parse::<u8>()
        .ok()
        .and_then(|v| T::try_from(v).ok())
        .ok_or_else(|| UriError::InvalidParameter { name, value: value.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn uri() -> SwarmUri {
        SwarmUri::new(SwarmId::from(vec![0xfb, 0xff, 0x01, 0x02]), &SwarmOptions::default_live())
    }

    #[test]
    fn test_format() {
        assert_eq!(uri().to_string(), "magnet:?xt=urn:ppspp:-_8BAg&x.cs=1024&x.cps=64&x.sc=16&x.im=2&x.htf=2&x.lsa=1&x.lw=16384");
    }

    #[test]
    fn test_parse_formatted() {
        let uri = uri();
        assert_eq!(SwarmUri::parse(&uri.to_string()), Ok(uri.clone()));
        assert_eq!(uri.to_string().parse::<SwarmUri>(), Ok(uri));
    }

    #[test]
    fn test_parse_ignores_unknown_and_reordered_params() {
        let parsed = SwarmUri::parse("magnet:?x.lw=16384&dn=foo&x.cs=1024&xt=urn:ppspp:-_8BAg&x.cps=64&x.sc=16&x.im=2&x.htf=2&x.lsa=1").unwrap();
        assert_eq!(parsed, uri());
    }

    #[test]
    fn test_swarm_options() {
        let mut base = SwarmOptions::default_live();
        base.label = "joined".to_string();
        base.chunk_size = 1;

        let mut options = SwarmOptions::default_live();
        options.chunk_size = 2048;
        let joined = SwarmUri::new(SwarmId::from(vec![1]), &options).options.swarm_options(base);
        assert_eq!(joined.chunk_size, 2048);
        assert_eq!(joined.label, "joined");
    }

    #[rstest]
    #[case::scheme("http://example.com/?xt=urn:ppspp:AQ", UriError::UnsupportedScheme("http".to_string()))]
    #[case::missing_id("magnet:?x.cs=1024&x.cps=64&x.sc=16&x.im=2&x.htf=2&x.lsa=1&x.lw=16384", UriError::MissingSwarmId)]
    #[case::wrong_urn("magnet:?xt=urn:btih:AQ", UriError::InvalidSwarmId("urn:btih:AQ".to_string()))]
    #[case::missing_param("magnet:?xt=urn:ppspp:AQ&x.cs=1024", UriError::MissingParameter(CHUNKS_PER_SIGNATURE))]
    #[case::not_a_number("magnet:?xt=urn:ppspp:AQ&x.cs=big", UriError::InvalidParameter { name: CHUNK_SIZE, value: "big".to_string() })]
    #[case::unknown_method("magnet:?xt=urn:ppspp:AQ&x.im=9", UriError::InvalidParameter { name: PROTECTION_METHOD, value: "9".to_string() })]
    fn test_parse_errors(#[case] s: &str, #[case] expected: UriError) {
        assert_eq!(SwarmUri::parse(s), Err(expected));
    }
}
