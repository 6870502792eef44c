//! Origin comparison and the handshake allow-list.

use url::{Origin, Url};

use crate::error::Result;

/// Parse the origin of `url`, or `None` for unparsable and opaque origins.
pub fn origin_of(url: &str) -> Option<Origin> {
    let origin = Url::parse(url).ok()?.origin();
    origin.is_tuple().then_some(origin)
}

/// Whether two URLs share scheme, host and port.
pub fn same_origin(a: &str, b: &str) -> bool {
    match (origin_of(a), origin_of(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Whether `url` is http or https.
pub fn is_http_like(url: &str) -> bool {
    Url::parse(url)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false)
}

/// Explicit set of origins allowed to open channels to the daemon.
#[derive(Debug, Clone, Default)]
pub struct OriginAllowList {
    origins: Vec<Origin>,
}

impl OriginAllowList {
    pub fn new<I, S>(origins: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parsed = Vec::new();
        for origin in origins {
            let origin = Url::parse(origin.as_ref())?.origin();
            if origin.is_tuple() {
                parsed.push(origin);
            }
        }
        Ok(Self { origins: parsed })
    }

    pub fn allows(&self, origin: &str) -> bool {
        origin_of(origin).is_some_and(|o| self.origins.contains(&o))
    }

    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }
}
