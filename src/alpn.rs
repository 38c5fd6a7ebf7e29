//! Application protocol advertisement.

use openssl::ssl::select_next_proto;

/// ALPN id for HTTP/2.
pub const H2: &[u8] = b"h2";

/// ALPN id for HTTP/1.1.
pub const HTTP_1_1: &[u8] = b"http/1.1";

/// Advertised list with HTTP/2, in wire format.
const HTTP2_WIRE: &[u8] = b"\x02h2\x08http/1.1";

/// Advertised list without HTTP/2, in wire format.
const HTTP1_WIRE: &[u8] = b"\x08http/1.1";

/// Fixed list of protocols a server advertises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advertiser {
    /// Length-prefixed wire format, most preferred first.
    wire: &'static [u8],
}

impl Advertiser {
    /// `["h2", "http/1.1"]` with HTTP/2 enabled, else `["http/1.1"]`.
    pub fn for_http(http2: bool) -> Self {
        let wire = if http2 { HTTP2_WIRE } else { HTTP1_WIRE };
        Advertiser { wire }
    }

    /// The advertised list in ALPN wire format.
    pub fn wire(&self) -> &'static [u8] {
        self.wire
    }

    /// Advertised protocol names.
    pub fn protocols(&self) -> impl Iterator<Item = &'static [u8]> {
        WireIter(self.wire)
    }

    /// Pick the first advertised protocol the client also offers.
    ///
    /// `client` is the client's list in wire format. `None` means the
    /// extension goes unacknowledged.
    pub fn select<'a>(&self, client: &'a [u8]) -> Option<&'a [u8]> {
        select_next_proto(self.wire, client)
    }
}

/// Encode names into the length-prefixed ALPN wire format.
pub fn encode_protocols<'a>(protocols: impl IntoIterator<Item = &'a [u8]>) -> Vec<u8> {
    let mut wire = Vec::new();
    for p in protocols {
        if p.is_empty() || p.len() > u8::MAX as usize {
            continue;
        }
        wire.push(p.len() as u8);
        wire.extend_from_slice(p);
    }
    wire
}

struct WireIter<'a>(&'a [u8]);

impl<'a> Iterator for WireIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        let (&len, rest) = self.0.split_first()?;
        let len = len as usize;
        if rest.len() < len {
            self.0 = &[];
            return None;
        }
        let (name, rest) = rest.split_at(len);
        self.0 = rest;
        Some(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http2_list() {
        let a = Advertiser::for_http(true);
        assert_eq!(a.wire(), b"\x02h2\x08http/1.1");
        let names: Vec<_> = a.protocols().collect();
        assert_eq!(names, vec![H2, HTTP_1_1]);
    }

    #[test]
    fn http1_list() {
        let a = Advertiser::for_http(false);
        assert_eq!(a.wire(), b"\x08http/1.1");
    }

    #[test]
    fn selects_first_server_entry_offered() {
        let a = Advertiser::for_http(true);
        let client = encode_protocols([HTTP_1_1, H2]);
        assert_eq!(a.select(&client), Some(H2));

        let client = encode_protocols([HTTP_1_1]);
        assert_eq!(a.select(&client), Some(HTTP_1_1));
    }

    #[test]
    fn fixed_lists_match_encoding() {
        assert_eq!(Advertiser::for_http(true).wire(), encode_protocols([H2, HTTP_1_1]));
        assert_eq!(Advertiser::for_http(false).wire(), encode_protocols([HTTP_1_1]));
    }

    #[test]
    fn selection_outlives_advertiser() {
        let client = encode_protocols([H2]);
        let selected = {
            let a = Advertiser::for_http(true);
            a.select(&client)
        };
        assert_eq!(selected, Some(H2));
    }

    #[test]
    fn disjoint_lists_select_nothing() {
        let a = Advertiser::for_http(false);
        let client = encode_protocols([&b"spdy/3"[..], H2]);
        assert_eq!(a.select(&client), None);
    }

    #[test]
    fn encode_skips_invalid_names() {
        let long = vec![b'x'; 300];
        let wire = encode_protocols([&b""[..], &long[..], H2]);
        assert_eq!(wire, b"\x02h2");
    }
}
